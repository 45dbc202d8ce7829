//! Scalar quantization codec.
//!
//! Each dimension is quantized independently to `nbits` levels using the
//! observed min/max of its vector, with per-vector scale parameters. This is
//! the only codec that stays effective on a batch of one, which is how the
//! cache invokes it. The payload is self-describing:
//!
//! ```text
//! [code u8][count u32][dim u32][nbits u8]
//! [min f32, step f32] x count
//! [packed codes: count * dim fields of nbits each]
//! ```

use super::{pack_bits, unpack_bits, ByteReader, CompressError, Method, MethodParams};

pub(crate) fn encode(vectors: &[Vec<f32>], params: &MethodParams) -> Result<Vec<u8>, CompressError> {
    let count = vectors.len();
    let dim = vectors[0].len();
    let nbits = params.nbits;
    let levels = (1u64 << nbits) as f32;
    let max_code = levels - 1.0;

    let mut out =
        Vec::with_capacity(10 + count * 8 + (count * dim * nbits as usize).div_ceil(8));
    out.push(Method::ScalarQuantization.code());
    out.extend_from_slice(&(count as u32).to_le_bytes());
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.push(nbits);

    let mut params_table = Vec::with_capacity(count);
    for v in vectors {
        let min = v.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = v.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;
        let step = if range <= f32::EPSILON {
            0.0
        } else {
            range / max_code
        };
        out.extend_from_slice(&min.to_le_bytes());
        out.extend_from_slice(&step.to_le_bytes());
        params_table.push((min, step));
    }

    let mut codes = Vec::with_capacity(count * dim);
    for (v, &(min, step)) in vectors.iter().zip(params_table.iter()) {
        for &x in v {
            let code = if step == 0.0 {
                0.0
            } else {
                ((x - min) / step).round().clamp(0.0, max_code)
            };
            codes.push(code as u32);
        }
    }
    out.extend_from_slice(&pack_bits(&codes, nbits));
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Vec<Vec<f32>>, CompressError> {
    let mut reader = ByteReader::new(bytes);
    let method = Method::from_code(reader.u8()?)?;
    if method != Method::ScalarQuantization {
        return Err(CompressError::UnsupportedMethod(format!(
            "payload encoded with {method}, expected sq"
        )));
    }

    let count = reader.u32()? as usize;
    let dim = reader.u32()? as usize;
    let nbits = reader.u8()?;
    if nbits == 0 || nbits > 16 {
        return Err(CompressError::Corrupt(format!("bad nbits {nbits}")));
    }

    let mut params_table = Vec::with_capacity(count);
    for _ in 0..count {
        let min = reader.f32()?;
        let step = reader.f32()?;
        params_table.push((min, step));
    }

    let codes = unpack_bits(reader.bytes(reader.remaining())?, nbits, count * dim)?;

    let mut vectors = Vec::with_capacity(count);
    for (i, &(min, step)) in params_table.iter().enumerate() {
        let row = &codes[i * dim..(i + 1) * dim];
        vectors.push(row.iter().map(|&code| min + code as f32 * step).collect());
    }
    Ok(vectors)
}

// =============================================================================
// Tests
// =============================================================================
