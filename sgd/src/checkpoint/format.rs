use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use super::{BestEpochs, CheckpointErr, CheckpointRecord, bits};
use crate::{learning_rate::LearnRateState, sync::BlockMomentumState};

const MAGIC: &[u8; 8] = b"SGDCKPT\0";
const END: &[u8; 8] = b"ENDCKPT\0";

/// The version written by this build.
pub const VERSION: u32 = 3;

/// The first version closing the payload with a checksum.
const CHECKSUMMED: u32 = 3;

const MAX_META_LEN: u64 = 1 << 30;
const MAX_PAYLOAD_LEN: u64 = 1 << 40;

/// Scalars and shapes, stored as JSON. Buffers travel in the binary payload.
#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    epoch: usize,
    total_samples_seen: u64,
    #[serde(with = "bits::exact")]
    learn_rate_per_sample: f64,
    minibatch_size: usize,
    #[serde(with = "bits::exact")]
    prev_criterion: f64,
    iteration: usize,
    parameter_lens: Vec<usize>,
    smoothed_lens: Vec<usize>,
    #[serde(with = "bits::exact_vec")]
    smoothed_counts: Vec<f64>,
    learn_rate_state: Option<LearnRateState>,
    best_epochs: BestEpochs,
    block_momentum_lens: Option<Vec<usize>>,
}

/// Version 1 predates the iteration counter, best epochs and block momentum.
#[derive(Debug, Deserialize)]
struct MetaV1 {
    epoch: usize,
    total_samples_seen: u64,
    #[serde(with = "bits::exact")]
    learn_rate_per_sample: f64,
    minibatch_size: usize,
    #[serde(with = "bits::exact")]
    prev_criterion: f64,
    parameter_lens: Vec<usize>,
    smoothed_lens: Vec<usize>,
    #[serde(with = "bits::exact_vec")]
    smoothed_counts: Vec<f64>,
    learn_rate_state: Option<LearnRateState>,
}

impl From<MetaV1> for Meta {
    fn from(v1: MetaV1) -> Self {
        Self {
            epoch: v1.epoch,
            total_samples_seen: v1.total_samples_seen,
            learn_rate_per_sample: v1.learn_rate_per_sample,
            minibatch_size: v1.minibatch_size,
            prev_criterion: v1.prev_criterion,
            iteration: 0,
            parameter_lens: v1.parameter_lens,
            smoothed_lens: v1.smoothed_lens,
            smoothed_counts: v1.smoothed_counts,
            learn_rate_state: v1.learn_rate_state,
            best_epochs: BestEpochs::default(),
            block_momentum_lens: None,
        }
    }
}

fn lens<T>(buffers: &[Vec<T>]) -> Vec<usize> {
    buffers.iter().map(Vec::len).collect()
}

/// Writes `record` in the current format.
///
/// Layout: magic, big endian `u32` version, big endian `u64` length and JSON
/// meta, big endian `u64` length and payload, big endian CRC-32 of the meta and
/// the payload, end marker. The payload holds the `f32` buffers followed by the
/// `f64` ones, in native byte order.
pub fn write_record<W: Write>(w: &mut W, record: &CheckpointRecord) -> Result<(), CheckpointErr> {
    let meta = Meta {
        epoch: record.epoch,
        total_samples_seen: record.total_samples_seen,
        learn_rate_per_sample: record.learn_rate_per_sample,
        minibatch_size: record.minibatch_size,
        prev_criterion: record.prev_criterion,
        iteration: record.iteration,
        parameter_lens: lens(&record.parameters),
        smoothed_lens: lens(&record.smoothed_gradients),
        smoothed_counts: record.smoothed_counts.clone(),
        learn_rate_state: record.learn_rate_state.clone(),
        best_epochs: record.best_epochs.clone(),
        block_momentum_lens: record.block_momentum.as_ref().map(|bm| lens(&bm.global)),
    };
    let meta = serde_json::to_vec(&meta)?;

    let singles: Vec<f32> = record
        .parameters
        .iter()
        .chain(&record.smoothed_gradients)
        .flatten()
        .copied()
        .collect();

    let doubles: Vec<f64> = record
        .block_momentum
        .iter()
        .flat_map(|bm| bm.global.iter().chain(&bm.momentum))
        .flatten()
        .copied()
        .collect();

    let singles: &[u8] = bytemuck::cast_slice(&singles);
    let doubles: &[u8] = bytemuck::cast_slice(&doubles);

    let mut crc = crc32fast::Hasher::new();
    crc.update(&meta);
    crc.update(singles);
    crc.update(doubles);

    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_be_bytes())?;
    w.write_all(&(meta.len() as u64).to_be_bytes())?;
    w.write_all(&meta)?;
    w.write_all(&((singles.len() + doubles.len()) as u64).to_be_bytes())?;
    w.write_all(singles)?;
    w.write_all(doubles)?;
    w.write_all(&crc.finalize().to_be_bytes())?;
    w.write_all(END)?;

    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, CheckpointErr> {
    let mut buf = [0; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, CheckpointErr> {
    let mut buf = [0; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Reads `len` bytes, growing the buffer only as they arrive.
fn read_bytes<R: Read>(r: &mut R, len: u64) -> Result<Vec<u8>, CheckpointErr> {
    let mut buf = Vec::new();
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(CheckpointErr::Truncated);
    }

    Ok(buf)
}

fn checked_sum<'a>(lens: impl IntoIterator<Item = &'a usize>) -> Option<usize> {
    lens.into_iter().try_fold(0usize, |acc, &n| acc.checked_add(n))
}

/// Returns the amount of `f32` values and the payload size in bytes the meta describes.
fn payload_shape(meta: &Meta) -> Result<(usize, u64), CheckpointErr> {
    let overflow = || CheckpointErr::Corrupt("buffer lengths overflow".into());

    let n_singles = checked_sum(meta.parameter_lens.iter().chain(&meta.smoothed_lens))
        .ok_or_else(overflow)?;
    let n_doubles = match &meta.block_momentum_lens {
        Some(l) => checked_sum(l)
            .and_then(|n| n.checked_mul(2))
            .ok_or_else(overflow)?,
        None => 0,
    };

    let bytes = n_singles
        .checked_mul(4)
        .zip(n_doubles.checked_mul(8))
        .and_then(|(s, d)| s.checked_add(d))
        .ok_or_else(overflow)?;

    Ok((n_singles, bytes as u64))
}

/// Streams `len` bytes of `r` through `crc` without keeping them.
fn skip<R: Read>(r: &mut R, len: u64, crc: &mut crc32fast::Hasher) -> Result<(), CheckpointErr> {
    let mut chunk = [0; 8192];
    let mut left = len;
    while left > 0 {
        let n = left.min(chunk.len() as u64) as usize;
        r.read_exact(&mut chunk[..n])?;
        crc.update(&chunk[..n]);
        left -= n as u64;
    }

    Ok(())
}

/// Checks a record's framing without decoding it.
///
/// Reads through the whole record, verifying the magic, the version, the
/// checksum when the version has one and the end marker.
///
/// # Returns
/// The record's version, or the first framing error found.
pub fn verify_record<R: Read>(r: &mut R) -> Result<u32, CheckpointErr> {
    let mut magic = [0; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CheckpointErr::BadMagic);
    }

    let version = read_u32(r)?;
    if version == 0 || version > VERSION {
        return Err(CheckpointErr::UnsupportedVersion(version));
    }

    let mut crc = crc32fast::Hasher::new();
    let meta_len = read_u64(r)?;
    if meta_len > MAX_META_LEN {
        return Err(CheckpointErr::Corrupt(format!("meta length {meta_len}")));
    }
    skip(r, meta_len, &mut crc)?;

    let payload_len = read_u64(r)?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CheckpointErr::Corrupt(format!("payload length {payload_len}")));
    }
    skip(r, payload_len, &mut crc)?;

    if version >= CHECKSUMMED && read_u32(r)? != crc.finalize() {
        return Err(CheckpointErr::Corrupt("checksum mismatch".into()));
    }

    let mut end = [0; 8];
    r.read_exact(&mut end)?;
    if &end != END {
        return Err(CheckpointErr::Truncated);
    }

    Ok(version)
}

/// Splits a flat buffer into consecutive chunks of the given lengths.
fn split<T: Copy>(flat: &[T], lens: &[usize]) -> Vec<Vec<T>> {
    let mut offset = 0;
    lens.iter()
        .map(|&n| {
            let chunk = flat[offset..offset + n].to_vec();
            offset += n;
            chunk
        })
        .collect()
}

/// Reads a record written by this or any earlier supported version.
///
/// # Returns
/// The record, or an error if the file isn't a checkpoint, was written by an
/// unknown version, ends early or doesn't add up.
pub fn read_record<R: Read>(r: &mut R) -> Result<CheckpointRecord, CheckpointErr> {
    let mut magic = [0; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CheckpointErr::BadMagic);
    }

    let version = read_u32(r)?;
    if version == 0 || version > VERSION {
        return Err(CheckpointErr::UnsupportedVersion(version));
    }

    let meta_len = read_u64(r)?;
    if meta_len > MAX_META_LEN {
        return Err(CheckpointErr::Corrupt(format!("meta length {meta_len}")));
    }
    let meta_bytes = read_bytes(r, meta_len)?;

    let meta: Meta = match version {
        1 => serde_json::from_slice::<MetaV1>(&meta_bytes)?.into(),
        _ => serde_json::from_slice(&meta_bytes)?,
    };

    if meta.smoothed_counts.len() != meta.smoothed_lens.len() {
        return Err(CheckpointErr::Corrupt(
            "smoothed counts don't match the smoothed gradients".into(),
        ));
    }

    let (n_singles, expected) = payload_shape(&meta)?;
    if expected > MAX_PAYLOAD_LEN {
        return Err(CheckpointErr::Corrupt(format!("payload length {expected}")));
    }

    let payload_len = read_u64(r)?;
    if payload_len != expected {
        return Err(CheckpointErr::Corrupt(format!(
            "payload holds {payload_len} bytes, expected {expected}"
        )));
    }

    let payload = read_bytes(r, payload_len)?;

    if version >= CHECKSUMMED {
        let stored = read_u32(r)?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&meta_bytes);
        crc.update(&payload);
        if crc.finalize() != stored {
            return Err(CheckpointErr::Corrupt("checksum mismatch".into()));
        }
    }

    let mut end = [0; 8];
    r.read_exact(&mut end)?;
    if &end != END {
        return Err(CheckpointErr::Truncated);
    }

    let (singles, doubles) = payload.split_at(n_singles * 4);
    let singles: Vec<f32> = singles
        .chunks_exact(4)
        .map(|c| {
            let mut b = [0; 4];
            b.copy_from_slice(c);
            f32::from_ne_bytes(b)
        })
        .collect();
    let doubles: Vec<f64> = doubles
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0; 8];
            b.copy_from_slice(c);
            f64::from_ne_bytes(b)
        })
        .collect();

    let (params, smoothed) = singles.split_at(meta.parameter_lens.iter().sum());

    let block_momentum = meta.block_momentum_lens.as_ref().map(|l| {
        let (global, momentum) = doubles.split_at(l.iter().sum());
        BlockMomentumState {
            global: split(global, l),
            momentum: split(momentum, l),
        }
    });

    Ok(CheckpointRecord {
        epoch: meta.epoch,
        total_samples_seen: meta.total_samples_seen,
        learn_rate_per_sample: meta.learn_rate_per_sample,
        minibatch_size: meta.minibatch_size,
        prev_criterion: meta.prev_criterion,
        iteration: meta.iteration,
        parameters: split(params, &meta.parameter_lens),
        smoothed_gradients: split(smoothed, &meta.smoothed_lens),
        smoothed_counts: meta.smoothed_counts,
        learn_rate_state: meta.learn_rate_state,
        best_epochs: meta.best_epochs,
        block_momentum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning_rate::Reduction;

    fn record() -> CheckpointRecord {
        let mut best_epochs = BestEpochs::default();
        best_epochs.update("err", 0.125, 3);

        CheckpointRecord {
            epoch: 4,
            total_samples_seen: 123_456,
            learn_rate_per_sample: 0.000_618_033_988_749_895,
            minibatch_size: 512,
            prev_criterion: 0.1 + 0.2,
            iteration: 77,
            parameters: vec![vec![1.5, -2.25], vec![0.1; 3]],
            smoothed_gradients: vec![vec![0.01, -0.02], vec![1e-7; 3]],
            smoothed_counts: vec![3., 9.],
            learn_rate_state: Some(LearnRateState {
                current: Some(0.000_618_033_988_749_895),
                prev_criterion: Some(0.75),
                reductions: vec![Reduction { epoch: 3, rate: 0.001 }],
                recent_rates: vec![0.001, 0.000_618],
                searched_epochs: 0,
                search_exhausted: false,
            }),
            best_epochs,
            block_momentum: Some(BlockMomentumState {
                global: vec![vec![1.0, 2.0], vec![3.0; 3]],
                momentum: vec![vec![0.5, -0.5], vec![1e-300; 3]],
            }),
        }
    }

    #[test]
    fn every_field_round_trips() {
        let record = record();
        let mut bytes = Vec::new();
        write_record(&mut bytes, &record).unwrap();

        let loaded = read_record(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(
            loaded.learn_rate_per_sample.to_bits(),
            record.learn_rate_per_sample.to_bits()
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = read_record(&mut &b"NOTACKPT........"[..]).unwrap_err();
        assert!(matches!(err, CheckpointErr::BadMagic));
    }

    #[test]
    fn newer_versions_are_rejected() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend((VERSION + 1).to_be_bytes());

        let err = read_record(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CheckpointErr::UnsupportedVersion(4)));
    }

    #[test]
    fn every_truncation_is_detected() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, &record()).unwrap();

        for len in [4, 12, 30, bytes.len() - 9, bytes.len() - 1] {
            let err = read_record(&mut &bytes[..len]).unwrap_err();
            assert!(matches!(err, CheckpointErr::Truncated), "{len}: {err}");
        }
    }

    #[test]
    fn payload_size_must_match_the_meta() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, &record()).unwrap();

        let meta_len = u64::from_be_bytes(bytes[12..20].try_into().unwrap()) as usize;
        let at = 20 + meta_len;
        let wrong = u64::from_be_bytes(bytes[at..at + 8].try_into().unwrap()) + 4;
        bytes[at..at + 8].copy_from_slice(&wrong.to_be_bytes());

        let err = read_record(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CheckpointErr::Corrupt(_)));
    }

    /// Builds a file of `version` out of a raw meta and payload, without checksum.
    fn unchecked(version: u32, meta: &serde_json::Value, payload: &[u8]) -> Vec<u8> {
        let meta = serde_json::to_vec(meta).unwrap();

        let mut bytes = MAGIC.to_vec();
        bytes.extend(version.to_be_bytes());
        bytes.extend((meta.len() as u64).to_be_bytes());
        bytes.extend(&meta);
        bytes.extend((payload.len() as u64).to_be_bytes());
        bytes.extend(payload);
        bytes.extend(END);
        bytes
    }

    #[test]
    fn flipped_payload_bytes_fail_the_checksum() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, &record()).unwrap();

        let meta_len = u64::from_be_bytes(bytes[12..20].try_into().unwrap()) as usize;
        bytes[20 + meta_len + 8 + 5] ^= 0x10;

        let err = read_record(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(&err, CheckpointErr::Corrupt(msg) if msg.contains("checksum")), "{err}");
    }

    #[test]
    fn overflowing_lengths_are_corrupt() {
        let meta = serde_json::json!({
            "epoch": 0,
            "total_samples_seen": 0,
            "learn_rate_per_sample": 0.5f64.to_bits(),
            "minibatch_size": 8,
            "prev_criterion": 1.25f64.to_bits(),
            "iteration": 0,
            "parameter_lens": [usize::MAX, 2],
            "smoothed_lens": [],
            "smoothed_counts": [],
            "learn_rate_state": null,
            "best_epochs": BestEpochs::default(),
            "block_momentum_lens": null,
        });

        let err = read_record(&mut unchecked(2, &meta, &[]).as_slice()).unwrap_err();
        assert!(matches!(&err, CheckpointErr::Corrupt(msg) if msg.contains("overflow")), "{err}");

        // fits in a usize, but no file is that large
        let mut meta = meta;
        meta["parameter_lens"] = serde_json::json!([usize::MAX / 8]);
        let err = read_record(&mut unchecked(2, &meta, &[]).as_slice()).unwrap_err();
        assert!(matches!(err, CheckpointErr::Corrupt(_)), "{err}");
    }

    #[test]
    fn huge_declared_meta_is_not_allocated() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend(VERSION.to_be_bytes());
        bytes.extend((MAX_META_LEN - 1).to_be_bytes());
        bytes.extend(b"{}");

        let err = read_record(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CheckpointErr::Truncated), "{err}");
    }

    #[test]
    fn framing_checks_agree_with_decoding() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, &record()).unwrap();
        assert_eq!(verify_record(&mut bytes.as_slice()).unwrap(), VERSION);

        let err = verify_record(&mut &bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, CheckpointErr::Truncated));

        let meta_len = u64::from_be_bytes(bytes[12..20].try_into().unwrap()) as usize;
        bytes[20 + meta_len + 8] ^= 0x01;
        let err = verify_record(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CheckpointErr::Corrupt(_)));
    }

    #[test]
    fn version_one_is_upconverted() {
        let meta = serde_json::json!({
            "epoch": 2,
            "total_samples_seen": 10,
            "learn_rate_per_sample": 0.5f64.to_bits(),
            "minibatch_size": 8,
            "prev_criterion": 1.25f64.to_bits(),
            "parameter_lens": [2],
            "smoothed_lens": [],
            "smoothed_counts": [],
            "learn_rate_state": null,
        });
        let payload: &[u8] = bytemuck::cast_slice(&[1.0f32, 2.0]);
        let bytes = unchecked(1, &meta, payload);

        let record = read_record(&mut bytes.as_slice()).unwrap();
        assert_eq!(record.epoch, 2);
        assert_eq!(record.learn_rate_per_sample, 0.5);
        assert_eq!(record.prev_criterion, 1.25);
        assert_eq!(record.parameters, [vec![1.0, 2.0]]);
        assert_eq!(record.iteration, 0);
        assert_eq!(record.block_momentum, None);
    }
}
