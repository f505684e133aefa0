//! Parameter Checkpoints
//!
//! A snapshot of the full [`Parameters`] tree, optionally with the optimizer
//! state, in a little-endian binary format:
//!
//! ```text
//! magic            10 bytes  "PICOGPT_CK"
//! format           u8        1
//! config length    u32
//! config           JSON ModelConfig
//! version          u64       optimizer updates applied
//! tensor count     u32
//! per tensor       rank u32, dims u32 × rank, len u32, f32 × len
//! has optimizer    u8        0 or 1
//! [optimizer]      step u64, tokens u64, beta1 f32, beta2 f32, epsilon f32,
//!                  first moments then second moments, same tensor layout
//! ```
//!
//! Tensors follow the canonical parameter order. A checkpoint loads only into
//! a model of exactly the configuration it was saved with; there is no
//! compatibility across configurations or format numbers.

use crate::error::{Error, Result};
use crate::model::{init_params, ModelConfig, Parameters};
use crate::optimizer::OptimizerState;
use crate::tensor::Tensor;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 10] = b"PICOGPT_CK";
const FORMAT: u8 = 1;
/// Upper bound on the embedded JSON config; real configs are a few hundred bytes
const MAX_CONFIG_LEN: usize = 64 * 1024;

/// Parameters plus, for resumable checkpoints, the optimizer state
pub struct Checkpoint {
    pub params: Parameters,
    pub optimizer: Option<OptimizerState>,
}

/// Write a checkpoint to `path`
pub fn save<P: AsRef<Path>>(
    path: P,
    params: &Parameters,
    optimizer: Option<&OptimizerState>,
) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_checkpoint(&mut writer, params, optimizer)?;
    writer.flush()?;
    log::debug!(
        "saved checkpoint (version {}, optimizer: {}) to {}",
        params.version,
        optimizer.is_some(),
        path.display()
    );
    Ok(())
}

/// Read a checkpoint from `path`
pub fn load<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let checkpoint = read_checkpoint(&mut reader)?;
    log::debug!(
        "loaded checkpoint (version {}) from {}",
        checkpoint.params.version,
        path.display()
    );
    Ok(checkpoint)
}

/// Read the parameters of a checkpoint that must match `expected`
pub fn load_params<P: AsRef<Path>>(path: P, expected: &ModelConfig) -> Result<Parameters> {
    let checkpoint = load(path)?;
    if &checkpoint.params.config != expected {
        return Err(Error::Checkpoint(format!(
            "config mismatch: checkpoint has {:?}, expected {:?}",
            checkpoint.params.config, expected
        )));
    }
    Ok(checkpoint.params)
}

/// Serialize a checkpoint into any writer
pub fn write_checkpoint<W: Write>(
    writer: &mut W,
    params: &Parameters,
    optimizer: Option<&OptimizerState>,
) -> Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_u8(FORMAT)?;

    let config_json = serde_json::to_vec(&params.config)?;
    writer.write_u32::<LittleEndian>(config_json.len() as u32)?;
    writer.write_all(&config_json)?;

    writer.write_u64::<LittleEndian>(params.version)?;
    let tensors = params.tensors();
    writer.write_u32::<LittleEndian>(tensors.len() as u32)?;
    for tensor in tensors {
        write_tensor(writer, tensor)?;
    }

    match optimizer {
        Some(state) => {
            writer.write_u8(1)?;
            writer.write_u64::<LittleEndian>(state.step)?;
            writer.write_u64::<LittleEndian>(state.tokens)?;
            writer.write_f32::<LittleEndian>(state.beta1)?;
            writer.write_f32::<LittleEndian>(state.beta2)?;
            writer.write_f32::<LittleEndian>(state.epsilon)?;
            for tensor in state.m.iter().chain(&state.v) {
                write_tensor(writer, tensor)?;
            }
        }
        None => writer.write_u8(0)?,
    }
    Ok(())
}

/// Deserialize a checkpoint from any reader
pub fn read_checkpoint<R: Read>(reader: &mut R) -> Result<Checkpoint> {
    let mut magic = [0u8; 10];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Checkpoint("bad magic bytes".into()));
    }
    let format = reader.read_u8()?;
    if format != FORMAT {
        return Err(Error::Checkpoint(format!("unsupported format {}", format)));
    }

    let config_len = reader.read_u32::<LittleEndian>()? as usize;
    if config_len > MAX_CONFIG_LEN {
        return Err(Error::Checkpoint(format!(
            "config length {} exceeds {} bytes",
            config_len, MAX_CONFIG_LEN
        )));
    }
    let mut config_json = vec![0u8; config_len];
    reader.read_exact(&mut config_json)?;
    let config: ModelConfig = serde_json::from_slice(&config_json)?;

    // The seed is irrelevant: every tensor is overwritten below.
    let mut params = init_params(&config, 0)?;
    params.version = reader.read_u64::<LittleEndian>()?;

    let count = reader.read_u32::<LittleEndian>()? as usize;
    let tensors = params.tensors_mut();
    if count != tensors.len() {
        return Err(Error::Checkpoint(format!(
            "expected {} tensors, found {}",
            tensors.len(),
            count
        )));
    }
    for tensor in tensors {
        read_tensor_into(reader, tensor)?;
    }

    let optimizer = match reader.read_u8()? {
        0 => None,
        1 => {
            let mut state = OptimizerState::new(&params, (0.9, 0.95));
            state.step = reader.read_u64::<LittleEndian>()?;
            state.tokens = reader.read_u64::<LittleEndian>()?;
            state.beta1 = reader.read_f32::<LittleEndian>()?;
            state.beta2 = reader.read_f32::<LittleEndian>()?;
            state.epsilon = reader.read_f32::<LittleEndian>()?;
            for tensor in state.m.iter_mut().chain(state.v.iter_mut()) {
                read_tensor_into(reader, tensor)?;
            }
            Some(state)
        }
        flag => {
            return Err(Error::Checkpoint(format!(
                "invalid optimizer flag {}",
                flag
            )))
        }
    };

    Ok(Checkpoint { params, optimizer })
}

fn write_tensor<W: Write>(writer: &mut W, tensor: &Tensor) -> Result<()> {
    writer.write_u32::<LittleEndian>(tensor.shape.len() as u32)?;
    for &dim in &tensor.shape {
        writer.write_u32::<LittleEndian>(dim as u32)?;
    }
    writer.write_u32::<LittleEndian>(tensor.data.len() as u32)?;
    for &val in &tensor.data {
        writer.write_f32::<LittleEndian>(val)?;
    }
    Ok(())
}

/// Read one tensor whose shape must equal `target`'s
fn read_tensor_into<R: Read>(reader: &mut R, target: &mut Tensor) -> Result<()> {
    let rank = reader.read_u32::<LittleEndian>()? as usize;
    if rank != target.shape.len() {
        return Err(Error::Checkpoint(format!(
            "tensor rank {} does not match expected shape {:?}",
            rank, target.shape
        )));
    }
    for &expected in &target.shape {
        let dim = reader.read_u32::<LittleEndian>()? as usize;
        if dim != expected {
            return Err(Error::Checkpoint(format!(
                "tensor dimension {} does not match expected shape {:?}",
                dim, target.shape
            )));
        }
    }
    let len = reader.read_u32::<LittleEndian>()? as usize;
    if len != target.data.len() {
        return Err(Error::Checkpoint(format!(
            "tensor length {} does not match expected shape {:?}",
            len, target.shape
        )));
    }
    reader.read_f32_into::<LittleEndian>(&mut target.data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::forward;

    #[test]
    fn test_roundtrip_preserves_logits() {
        let config = ModelConfig::tiny(9, 6);
        let mut params = init_params(&config, 17).unwrap();
        params.version = 12;

        let mut bytes = Vec::new();
        write_checkpoint(&mut bytes, &params, None).unwrap();
        let restored = read_checkpoint(&mut bytes.as_slice()).unwrap();

        assert!(restored.optimizer.is_none());
        assert_eq!(restored.params.version, 12);
        let probe = vec![vec![3, 1, 4, 1, 5, 8]];
        assert_eq!(
            forward(&params, &probe).unwrap(),
            forward(&restored.params, &probe).unwrap()
        );
    }

    #[test]
    fn test_roundtrip_with_optimizer_state() {
        let params = init_params(&ModelConfig::tiny(5, 4), 1).unwrap();
        let mut state = OptimizerState::new(&params, (0.8, 0.9));
        state.step = 3;
        state.tokens = 99;
        state.m[0].data[0] = 0.5;
        state.v[1].data[0] = 0.25;

        let mut bytes = Vec::new();
        write_checkpoint(&mut bytes, &params, Some(&state)).unwrap();
        let restored = read_checkpoint(&mut bytes.as_slice())
            .unwrap()
            .optimizer
            .unwrap();

        assert_eq!(restored.step, 3);
        assert_eq!(restored.tokens, 99);
        assert_eq!(restored.beta1, 0.8);
        assert_eq!(restored.m, state.m);
        assert_eq!(restored.v, state.v);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = b"NOT_A_CKPT\x01".to_vec();
        bytes.extend_from_slice(&[0; 16]);
        assert!(matches!(
            read_checkpoint(&mut bytes.as_slice()),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_oversized_config_header_is_rejected() {
        let mut bytes = MAGIC.to_vec();
        bytes.push(FORMAT);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        match read_checkpoint(&mut bytes.as_slice()) {
            Err(Error::Checkpoint(msg)) => assert!(msg.contains("config length")),
            other => panic!("expected a checkpoint error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_config_mismatch_is_rejected() {
        let params = init_params(&ModelConfig::tiny(5, 4), 1).unwrap();
        let path = std::env::temp_dir().join(format!("picogpt_ckpt_{}.bin", std::process::id()));
        save(&path, &params, None).unwrap();

        assert!(load_params(&path, &ModelConfig::tiny(5, 4)).is_ok());
        assert!(matches!(
            load_params(&path, &ModelConfig::tiny(6, 4)),
            Err(Error::Checkpoint(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
