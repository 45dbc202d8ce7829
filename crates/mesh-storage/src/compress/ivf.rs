//! Inverted-file product quantization codec.
//!
//! Assigns each vector to one of `nlist` coarse k-means clusters, stores the
//! cluster index, and PQ-encodes the residual (vector minus its coarse
//! centroid). The embedded residual payload reuses the PQ codec verbatim.
//!
//! ```text
//! [code u8][count u32][dim u32][nlist u16]
//! coarse centroids: nlist * dim f32
//! assignments: count * u16
//! [residual payload length u32][pq payload]
//! ```

use super::{pq, ByteReader, CompressError, Method, MethodParams};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Coarse clustering seed, distinct from the PQ training seed so the two
/// stages do not reuse sample indices.
const COARSE_SEED: u64 = 0x69_76_66_2d_70_71; // "ivf-pq"

const COARSE_ITERS: usize = 10;

pub(crate) fn encode(vectors: &[Vec<f32>], params: &MethodParams) -> Result<Vec<u8>, CompressError> {
    let count = vectors.len();
    let dim = vectors[0].len();
    let nlist = params.nlist.min(count).min(u16::MAX as usize);

    let mut rng = StdRng::seed_from_u64(COARSE_SEED);
    let centroids = pq::kmeans(vectors, nlist, COARSE_ITERS, &mut rng);

    let assignments: Vec<usize> = vectors
        .iter()
        .map(|v| pq::nearest_centroid(v, &centroids))
        .collect();

    let residuals: Vec<Vec<f32>> = vectors
        .iter()
        .zip(assignments.iter())
        .map(|(v, &c)| {
            v.iter()
                .zip(centroids[c].iter())
                .map(|(x, m)| x - m)
                .collect()
        })
        .collect();

    let residual_payload = pq::encode(&residuals, params)?;

    let mut out = Vec::with_capacity(
        11 + centroids.len() * dim * 4 + count * 2 + 4 + residual_payload.len(),
    );
    out.push(Method::IvfProductQuantization.code());
    out.extend_from_slice(&(count as u32).to_le_bytes());
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.extend_from_slice(&(centroids.len() as u16).to_le_bytes());
    for centroid in &centroids {
        for &x in centroid {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }
    for &a in &assignments {
        out.extend_from_slice(&(a as u16).to_le_bytes());
    }
    out.extend_from_slice(&(residual_payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&residual_payload);
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Vec<Vec<f32>>, CompressError> {
    let mut reader = ByteReader::new(bytes);
    let method = Method::from_code(reader.u8()?)?;
    if method != Method::IvfProductQuantization {
        return Err(CompressError::UnsupportedMethod(format!(
            "payload encoded with {method}, expected ivf_pq"
        )));
    }

    let count = reader.u32()? as usize;
    let dim = reader.u32()? as usize;
    let nlist = reader.u16()? as usize;
    if nlist == 0 {
        return Err(CompressError::Corrupt("bad ivf header".into()));
    }

    let mut centroids = Vec::with_capacity(nlist);
    for _ in 0..nlist {
        centroids.push(reader.f32_vec(dim)?);
    }

    let mut assignments = Vec::with_capacity(count);
    for _ in 0..count {
        let a = reader.u16()? as usize;
        if a >= nlist {
            return Err(CompressError::Corrupt(format!(
                "assignment {a} out of range (nlist={nlist})"
            )));
        }
        assignments.push(a);
    }

    let residual_len = reader.u32()? as usize;
    let residuals = pq::decode(reader.bytes(residual_len)?)?;
    if residuals.len() != count {
        return Err(CompressError::Corrupt(format!(
            "residual count {} does not match header count {count}",
            residuals.len()
        )));
    }

    let vectors = residuals
        .into_iter()
        .zip(assignments.iter())
        .map(|(residual, &c)| {
            residual
                .iter()
                .zip(centroids[c].iter())
                .map(|(r, m)| r + m)
                .collect()
        })
        .collect();
    Ok(vectors)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::cosine_similarity;

    fn clustered_batch(per_cluster: usize, dim: usize) -> Vec<Vec<f32>> {
        // Three well-separated cluster centers with small deterministic jitter.
        let centers = [1.0f32, -1.0, 3.0];
        let mut out = Vec::new();
        for (c, &center) in centers.iter().enumerate() {
            for i in 0..per_cluster {
                out.push(
                    (0..dim)
                        .map(|j| center + ((i * 7 + j * 3 + c) % 13) as f32 * 0.01)
                        .collect(),
                );
            }
        }
        out
    }

    #[test]
    fn test_roundtrip_accuracy() {
        let vectors = clustered_batch(40, 24);
        let params = MethodParams {
            nlist: 3,
            ..Default::default()
        };
        let encoded = encode(&vectors, &params).unwrap();
        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded.len(), vectors.len());
        for (a, b) in vectors.iter().zip(decoded.iter()) {
            assert!(cosine_similarity(a, b) > 0.99);
        }
    }

    #[test]
    fn test_nlist_clamped_to_count() {
        // Fewer vectors than requested clusters must not panic.
        let vectors = clustered_batch(2, 8); // 6 vectors
        let params = MethodParams {
            nlist: 64,
            ..Default::default()
        };
        let encoded = encode(&vectors, &params).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.len(), 6);
    }

    #[test]
    fn test_encode_deterministic() {
        let vectors = clustered_batch(10, 16);
        let params = MethodParams::default();
        assert_eq!(
            encode(&vectors, &params).unwrap(),
            encode(&vectors, &params).unwrap()
        );
    }

    #[test]
    fn test_decode_wrong_codec() {
        let vectors = clustered_batch(4, 8);
        let mut encoded = encode(&vectors, &MethodParams::default()).unwrap();
        encoded[0] = Method::ScalarQuantization.code();
        assert!(matches!(
            decode(&encoded),
            Err(CompressError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let vectors = clustered_batch(8, 8);
        let encoded = encode(&vectors, &MethodParams::default()).unwrap();
        assert!(matches!(
            decode(&encoded[..encoded.len() / 2]),
            Err(CompressError::Corrupt(_))
        ));
    }
}
