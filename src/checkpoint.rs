//! Model Checkpointing
//!
//! Weights are written as a flat key → tensor archive. Each key is
//! `module_<index>_<param>`, where the index follows the model's flat module
//! order and the parameter name is the module's own (dotted for composites):
//!
//! ```text
//! module_0_W                 embedding table
//! module_2_W_q.W             block 0 attention query projection
//! module_4_linear1.b         block 0 feed-forward first bias
//! module_6_gamma             final layer norm scale
//! ```
//!
//! ## File Layout
//!
//! ```text
//! "MINILLM_CKPT"  magic
//! u8              version (1)
//! u32 + bytes     config as JSON
//! u32             number of entries
//! per entry:
//!     u32 + bytes     key (UTF-8)
//!     u32 + u32 × n   shape
//!     u32 + f64 × m   data (little-endian)
//! ```
//!
//! ## Shape-Tolerant Loading
//!
//! Loading never fails because of a shape difference. When a stored tensor
//! and the live parameter disagree (typically the vocabulary grew), only
//! the leading sub-block common to both is copied:
//!
//! ```text
//! saved  [5, 4]        live [7, 4]
//! ┌────────┐           ┌────────┐
//! │ copied │           │ copied │
//! └────────┘           ├────────┤
//!                      │ fresh  │   keeps its initial values
//!                      └────────┘
//! ```
//!
//! Keys missing from the archive, or with a different number of
//! dimensions, leave the live parameter untouched.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::model::TransformerModel;
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};

const MAGIC: &[u8; 12] = b"MINILLM_CKPT";
const VERSION: u8 = 1;

/// Archive key for one parameter
pub fn param_key(module_index: usize, param: &str) -> String {
    format!("module_{}_{}", module_index, param)
}

/// Outcome of restoring an archive into a live model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Copied with identical shape
    pub exact: usize,
    /// Copied as an overlapping sub-block
    pub partial: usize,
    /// Live parameters left at their current values
    pub skipped: Vec<String>,
}

/// Weights of a model plus the configuration that produced them
pub struct Checkpoint {
    pub config: Config,
    pub tensors: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    pub fn from_model(model: &TransformerModel) -> Self {
        let mut tensors = BTreeMap::new();
        for (idx, module) in model.modules().into_iter().enumerate() {
            for (name, value) in module.parameters() {
                tensors.insert(param_key(idx, &name), value.clone());
            }
        }
        Self {
            config: model.config.clone(),
            tensors,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = BufWriter::new(File::create(path)?);

        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;
        write_bytes(&mut file, serde_json::to_string(&self.config)?.as_bytes())?;

        write_u32(&mut file, self.tensors.len())?;
        for (key, tensor) in &self.tensors {
            write_bytes(&mut file, key.as_bytes())?;
            write_tensor(&mut file, tensor)?;
        }
        file.flush()?;

        info!(path = %path.display(), tensors = self.tensors.len(), "checkpoint saved");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 12];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid_data("invalid checkpoint header"));
        }
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != VERSION {
            return Err(invalid_data(&format!(
                "unsupported checkpoint version: {}",
                version[0]
            )));
        }

        let config: Config = serde_json::from_slice(&read_bytes(&mut file)?)?;

        let count = read_u32(&mut file)?;
        let mut tensors = BTreeMap::new();
        for _ in 0..count {
            let key = String::from_utf8(read_bytes(&mut file)?)
                .map_err(|_| invalid_data("checkpoint key is not UTF-8"))?;
            tensors.insert(key, read_tensor(&mut file)?);
        }

        info!(path = %path.display(), tensors = tensors.len(), "checkpoint loaded");
        Ok(Self { config, tensors })
    }

    /// Copy stored weights into `model` in place
    pub fn restore_into(&self, model: &mut TransformerModel) -> LoadReport {
        let mut report = LoadReport::default();
        for (idx, module) in model.modules_mut().into_iter().enumerate() {
            for param in module.params_mut() {
                let key = param_key(idx, &param.name);
                match self.tensors.get(&key) {
                    Some(saved) if saved.shape == param.value.shape => {
                        param.value.data.copy_from_slice(&saved.data);
                        report.exact += 1;
                    }
                    Some(saved) if saved.ndim() == param.value.ndim() => {
                        copy_overlap(saved, param.value);
                        report.partial += 1;
                    }
                    Some(saved) => {
                        warn!(
                            key = %key,
                            saved = ?saved.shape,
                            live = ?param.value.shape,
                            "skipping checkpoint entry with different rank"
                        );
                        report.skipped.push(key);
                    }
                    None => {
                        warn!(key = %key, "parameter missing from checkpoint");
                        report.skipped.push(key);
                    }
                }
            }
        }
        report
    }
}

/// Write every parameter of `model` to `path`
pub fn save_model_weights<P: AsRef<Path>>(model: &TransformerModel, path: P) -> Result<()> {
    Checkpoint::from_model(model).save(path)
}

/// Restore `model` from `path`, tolerating shape differences
pub fn load_model_weights<P: AsRef<Path>>(
    model: &mut TransformerModel,
    path: P,
) -> Result<LoadReport> {
    Ok(Checkpoint::load(path)?.restore_into(model))
}

/// Copy the leading block common to `src` and `dst` (same rank)
fn copy_overlap(src: &Tensor, dst: &mut Tensor) {
    let overlap: Vec<usize> = src
        .shape
        .iter()
        .zip(&dst.shape)
        .map(|(&s, &d)| s.min(d))
        .collect();
    let count: usize = overlap.iter().product();
    let mut index = vec![0usize; overlap.len()];

    for _ in 0..count {
        let src_offset: usize = index.iter().zip(&src.strides).map(|(i, s)| i * s).sum();
        let dst_offset: usize = index.iter().zip(&dst.strides).map(|(i, s)| i * s).sum();
        dst.data[dst_offset] = src.data[src_offset];

        // Odometer increment, last axis fastest
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < overlap[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

fn invalid_data(msg: &str) -> EngineError {
    EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string()))
}

fn write_u32<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value).map_err(|_| invalid_data("value exceeds u32 range"))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<usize> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf) as usize)
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(w, bytes.len())?;
    w.write_all(bytes)?;
    Ok(())
}

/// Exactly `len` bytes; a length field from a damaged file never sizes the
/// allocation up front
fn read_exact_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(invalid_data("checkpoint is truncated"));
    }
    Ok(buf)
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)?;
    read_exact_vec(r, len)
}

fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(w, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(w, dim)?;
    }
    write_u32(w, tensor.data.len())?;
    for &v in &tensor.data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_tensor<R: Read>(r: &mut R) -> Result<Tensor> {
    let ndim = read_u32(r)?;
    let shape = (0..ndim).map(|_| read_u32(r)).collect::<Result<Vec<_>>>()?;
    let len = read_u32(r)?;
    let numel = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
    if numel != Some(len) {
        return Err(invalid_data("tensor data does not match its shape"));
    }
    let byte_len = len
        .checked_mul(8)
        .ok_or_else(|| invalid_data("tensor too large"))?;
    let bytes = read_exact_vec(r, byte_len)?;
    let data = bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect();
    Ok(Tensor::new(data, shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Module;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("minillm_ckpt_{}_{}.bin", tag, std::process::id()))
    }

    fn model(vocab_size: usize, seed: u64) -> TransformerModel {
        TransformerModel::new(&Config {
            vocab_size,
            seed,
            ..Config::tiny()
        })
    }

    fn all_params(model: &TransformerModel) -> Vec<(String, Tensor)> {
        model
            .modules()
            .into_iter()
            .enumerate()
            .flat_map(|(i, m)| {
                m.parameters()
                    .into_iter()
                    .map(move |(n, t)| (param_key(i, &n), t.clone()))
            })
            .collect()
    }

    #[test]
    fn test_key_format() {
        let ckpt = Checkpoint::from_model(&model(6, 1));
        assert!(ckpt.tensors.contains_key("module_0_W"));
        assert!(ckpt.tensors.contains_key("module_2_W_q.W"));
        assert!(ckpt.tensors.contains_key("module_4_linear1.b"));
        assert!(ckpt.tensors.contains_key("module_5_gamma"));
        assert!(ckpt.tensors.contains_key("module_6_W"));
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let path = temp_path("roundtrip");
        let source = model(6, 1);
        save_model_weights(&source, &path).expect("save");

        let mut target = model(6, 99);
        let report = load_model_weights(&mut target, &path).expect("load");
        std::fs::remove_file(&path).ok();

        assert!(report.skipped.is_empty());
        assert_eq!(report.partial, 0);
        for ((ka, a), (kb, b)) in all_params(&source).iter().zip(all_params(&target).iter()) {
            assert_eq!(ka, kb);
            assert_eq!(a.data, b.data, "{} differs", ka);
        }
    }

    #[test]
    fn test_larger_vocab_keeps_overlap() {
        let path = temp_path("grow");
        let source = model(6, 1);
        save_model_weights(&source, &path).expect("save");

        let mut target = model(9, 2);
        let fresh_row = target.embedding.weight.data[6 * 16..7 * 16].to_vec();
        let report = load_model_weights(&mut target, &path).expect("load");
        std::fs::remove_file(&path).ok();

        // Embedding [V, d] and output head [d, V] both changed shape
        assert_eq!(report.partial, 2);
        assert!(report.skipped.is_empty());

        let d = 16;
        assert_eq!(
            &target.embedding.weight.data[..6 * d],
            &source.embedding.weight.data[..6 * d]
        );
        assert_eq!(&target.embedding.weight.data[6 * d..7 * d], &fresh_row[..]);

        for row in 0..d {
            assert_eq!(
                &target.output_head.weight.data[row * 9..row * 9 + 6],
                &source.output_head.weight.data[row * 6..row * 6 + 6]
            );
        }
        assert_eq!(target.final_ln.gamma.data, source.final_ln.gamma.data);
    }

    #[test]
    fn test_smaller_target_takes_leading_block() {
        let src = Tensor::new((0..12).map(|v| v as f64).collect(), vec![3, 4]);
        let mut dst = Tensor::zeros(vec![2, 5]);
        copy_overlap(&src, &mut dst);
        assert_eq!(
            dst.data,
            vec![0.0, 1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 7.0, 0.0]
        );
    }

    #[test]
    fn test_missing_keys_are_skipped() {
        let mut ckpt = Checkpoint::from_model(&model(6, 1));
        ckpt.tensors.remove("module_5_beta");
        let mut target = model(6, 3);
        let before = target.final_ln.beta.clone();
        let report = ckpt.restore_into(&mut target);
        assert_eq!(report.skipped, vec!["module_5_beta".to_string()]);
        assert_eq!(target.final_ln.beta.data, before.data);
    }

    #[test]
    fn test_bad_header_is_error() {
        let path = temp_path("garbage");
        std::fs::write(&path, b"not a checkpoint at all").expect("write");
        let result = Checkpoint::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    fn header() -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.push(VERSION);
        let config = serde_json::to_string(&Config::tiny()).expect("json");
        bytes.extend((config.len() as u32).to_le_bytes());
        bytes.extend(config.as_bytes());
        bytes
    }

    fn load_bytes(name: &str, bytes: &[u8]) -> Result<Checkpoint> {
        let path = temp_path(name);
        std::fs::write(&path, bytes).expect("write");
        let result = Checkpoint::load(&path);
        std::fs::remove_file(&path).ok();
        result
    }

    #[test]
    fn test_oversized_lengths_are_errors() {
        // Config length far past the end of the file
        let mut bytes = MAGIC.to_vec();
        bytes.push(VERSION);
        bytes.extend(u32::MAX.to_le_bytes());
        bytes.extend(b"{}");
        assert!(matches!(load_bytes("huge_config", &bytes), Err(EngineError::Io(_))));

        // One tensor claiming ~2^31 values with none present
        let mut bytes = header();
        bytes.extend(1u32.to_le_bytes());
        bytes.extend(1u32.to_le_bytes());
        bytes.push(b'k');
        bytes.extend(1u32.to_le_bytes());
        bytes.extend(0x7FFF_FFFFu32.to_le_bytes());
        bytes.extend(0x7FFF_FFFFu32.to_le_bytes());
        assert!(matches!(load_bytes("huge_tensor", &bytes), Err(EngineError::Io(_))));

        // Shape whose element count overflows
        let mut bytes = header();
        bytes.extend(1u32.to_le_bytes());
        bytes.extend(1u32.to_le_bytes());
        bytes.push(b'k');
        bytes.extend(3u32.to_le_bytes());
        for _ in 0..4 {
            bytes.extend(u32::MAX.to_le_bytes());
        }
        assert!(matches!(load_bytes("overflow", &bytes), Err(EngineError::Io(_))));
    }

    #[test]
    fn test_truncated_file_is_error() {
        let path = temp_path("truncated");
        save_model_weights(&model(6, 1), &path).expect("save");
        let bytes = std::fs::read(&path).expect("read");
        std::fs::remove_file(&path).ok();
        let result = load_bytes("truncated_copy", &bytes[..bytes.len() - 12]);
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_config_travels_with_weights() {
        let path = temp_path("config");
        let source = model(6, 7);
        save_model_weights(&source, &path).expect("save");
        let ckpt = Checkpoint::load(&path).expect("load");
        std::fs::remove_file(&path).ok();
        assert_eq!(ckpt.config.vocab_size, 6);
        assert_eq!(ckpt.config.seed, 7);
    }
}
