//! Minimal safetensors container for `F32` tensors.
//!
//! Layout: `u64` little-endian header length, a compact JSON header mapping
//! each tensor name to `{"dtype":"F32","shape":[..],"data_offsets":[start,end]}`
//! padded with spaces to a multiple of 8 bytes, then the raw little-endian f32
//! data of every tensor in declaration order.

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const DTYPE_F32: &str = "F32";
const HEADER_ALIGN: usize = 8;

/// Named row-major f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct F32Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl F32Tensor {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RawEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// One parsed header entry.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderEntry {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [usize; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Length of the (padded) JSON header in bytes.
    pub len: usize,
    /// Entries ordered by data offset.
    pub entries: Vec<HeaderEntry>,
}

impl Header {
    pub fn data_start(&self) -> usize {
        8 + self.len
    }
}

/// Serialize `tensors` into safetensors bytes.
pub fn encode(tensors: &[F32Tensor]) -> Result<Vec<u8>> {
    ensure!(!tensors.is_empty(), "Refusing to write an empty tensor file");

    let mut header = String::from("{");
    let mut offset = 0usize;
    let mut seen = HashSet::with_capacity(tensors.len());
    for (i, t) in tensors.iter().enumerate() {
        ensure!(seen.insert(t.name.as_str()), "Duplicate tensor name {}", t.name);
        ensure!(
            t.numel() == t.data.len(),
            "Tensor {} has shape {:?} but {} values",
            t.name,
            t.shape,
            t.data.len()
        );
        let size = t.data.len() * std::mem::size_of::<f32>();
        let entry = RawEntry {
            dtype: DTYPE_F32.to_string(),
            shape: t.shape.clone(),
            data_offsets: [offset, offset + size],
        };
        if i > 0 {
            header.push(',');
        }
        header.push_str(&serde_json::to_string(&t.name)?);
        header.push(':');
        header.push_str(&serde_json::to_string(&entry)?);
        offset += size;
    }
    header.push('}');

    let mut header_bytes = header.into_bytes();
    let pad = (HEADER_ALIGN - header_bytes.len() % HEADER_ALIGN) % HEADER_ALIGN;
    header_bytes.extend(std::iter::repeat_n(b' ', pad));

    let mut out = Vec::with_capacity(8 + header_bytes.len() + offset);
    out.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    for t in tensors {
        for v in &t.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(out)
}

/// Write `tensors` to `path`, creating parent directories as needed.
pub fn write_safetensors<P: AsRef<Path>>(path: P, tensors: &[F32Tensor]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = encode(tensors)?;
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(&bytes)?;
    Ok(())
}

pub fn read_header(bytes: &[u8]) -> Result<Header> {
    ensure!(bytes.len() >= 8, "File too short for a safetensors header");
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let declared = u64::from_le_bytes(len_bytes);
    let Some((len, end)) = usize::try_from(declared)
        .ok()
        .and_then(|len| 8usize.checked_add(len).map(|end| (len, end)))
        .filter(|&(_, end)| end <= bytes.len())
    else {
        bail!(
            "Header length {declared} exceeds file size {}",
            bytes.len()
        );
    };

    let raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&bytes[8..end]).context("Malformed safetensors header")?;
    let mut entries = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        if name == "__metadata__" {
            continue;
        }
        let entry: RawEntry = serde_json::from_value(value)
            .with_context(|| format!("Malformed header entry {name}"))?;
        entries.push(HeaderEntry {
            name,
            dtype: entry.dtype,
            shape: entry.shape,
            data_offsets: entry.data_offsets,
        });
    }
    entries.sort_by_key(|e| e.data_offsets);
    Ok(Header { len, entries })
}

/// Decode every tensor in `bytes`, in data order.
pub fn decode(bytes: &[u8]) -> Result<Vec<F32Tensor>> {
    let header = read_header(bytes)?;
    let data = &bytes[header.data_start()..];
    let mut tensors = Vec::with_capacity(header.entries.len());
    for entry in header.entries {
        if entry.dtype != DTYPE_F32 {
            bail!("Tensor {} has unsupported dtype {}", entry.name, entry.dtype);
        }
        let [start, end] = entry.data_offsets;
        ensure!(
            start <= end && end <= data.len(),
            "Tensor {} offsets {start}..{end} out of range",
            entry.name
        );
        ensure!(
            (end - start) % 4 == 0,
            "Tensor {} byte length {} is not a multiple of 4",
            entry.name,
            end - start
        );
        let values: Vec<f32> = data[start..end]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let numel = entry
            .shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d));
        ensure!(
            numel == Some(values.len()),
            "Tensor {} has shape {:?} but {} values",
            entry.name,
            entry.shape,
            values.len()
        );
        tensors.push(F32Tensor {
            name: entry.name,
            shape: entry.shape,
            data: values,
        });
    }
    Ok(tensors)
}

pub fn read_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<F32Tensor>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn tensor(name: &str, shape: &[usize]) -> F32Tensor {
        let numel = shape.iter().product::<usize>();
        F32Tensor {
            name: name.to_string(),
            shape: shape.to_vec(),
            data: (0..numel).map(|i| i as f32 * 0.5 - 1.0).collect(),
        }
    }

    #[test]
    fn header_is_compact_and_padded() {
        let bytes = encode(&[tensor("w0", &[2, 3]), tensor("b0", &[2])]).unwrap();
        let len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        assert_eq!(len % 8, 0);
        let json = std::str::from_utf8(&bytes[8..8 + len]).unwrap();
        assert_eq!(
            json.trim_end(),
            r#"{"w0":{"dtype":"F32","shape":[2,3],"data_offsets":[0,24]},"b0":{"dtype":"F32","shape":[2],"data_offsets":[24,32]}}"#
        );
        assert!(json[json.trim_end().len()..].bytes().all(|b| b == b' '));
        assert_eq!(bytes.len(), 8 + len + 32);
        // First value of w0 is -1.0.
        assert_eq!(bytes[8 + len..8 + len + 4], (-1.0f32).to_le_bytes());
    }

    #[test]
    fn offsets_partition_data_block() {
        let tensors = vec![
            tensor("a", &[7]),
            tensor("b", &[1, 1]),
            tensor("c", &[3, 2, 2]),
            tensor("d", &[5]),
        ];
        let bytes = encode(&tensors).unwrap();
        let header = read_header(&bytes).unwrap();
        let mut expected_start = 0;
        for (entry, t) in header.entries.iter().zip(&tensors) {
            assert_eq!(entry.name, t.name);
            assert_eq!(entry.dtype, "F32");
            assert_eq!(entry.shape, t.shape);
            assert_eq!(entry.data_offsets[0], expected_start);
            expected_start = entry.data_offsets[1];
        }
        assert_eq!(expected_start, bytes.len() - header.data_start());
        assert_eq!(decode(&bytes).unwrap(), tensors);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(encode(&[]).is_err());
        let mut bad = tensor("x", &[2, 2]);
        bad.data.pop();
        assert!(encode(&[bad]).is_err());
        assert!(read_header(&[1, 2, 3]).is_err());
    }

    #[test]
    fn oversized_header_length_is_an_error() {
        let bytes = [u64::MAX.to_le_bytes().as_slice(), b"{}"].concat();
        assert!(read_header(&bytes).is_err());
        assert!(decode(&bytes).is_err());

        let mut bytes = 3u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(read_header(&bytes).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = encode(&[tensor("a", &[2]), tensor("a", &[3])]).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn ragged_data_length_is_rejected() {
        let header = br#"{"x":{"dtype":"F32","shape":[1],"data_offsets":[0,6]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(&[0u8; 6]);
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn random_tensors_survive_encode_decode() {
        let mut rng = SmallRng::seed_from_u64(7);
        for case in 0..50 {
            let count = rng.random_range(1..5);
            let tensors: Vec<F32Tensor> = (0..count)
                .map(|i| {
                    let rank = rng.random_range(1..4);
                    let shape: Vec<usize> = (0..rank).map(|_| rng.random_range(1..6)).collect();
                    let numel = shape.iter().product::<usize>();
                    F32Tensor {
                        name: format!("t{case}_{i}"),
                        shape,
                        data: (0..numel).map(|_| rng.random_range(-1e3f32..1e3)).collect(),
                    }
                })
                .collect();
            let bytes = encode(&tensors).unwrap();
            let header = read_header(&bytes).unwrap();
            assert_eq!(header.len % 8, 0);
            assert_eq!(header.entries.len(), count);
            assert_eq!(decode(&bytes).unwrap(), tensors);
        }
    }

    #[test]
    fn candle_can_load_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weights.safetensors");
        let tensors = vec![tensor("w0", &[4, 2]), tensor("b0", &[4])];
        write_safetensors(&path, &tensors).unwrap();

        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 2);
        let w0 = &loaded["w0"];
        assert_eq!(w0.dims(), &[4, 2]);
        assert_eq!(w0.flatten_all().unwrap().to_vec1::<f32>().unwrap(), tensors[0].data);
        assert_eq!(read_tensors(&path).unwrap(), tensors);
    }
}
