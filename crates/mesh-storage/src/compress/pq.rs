//! Product quantization codec.
//!
//! Splits each vector into `nsubvectors` contiguous sub-vectors and quantizes
//! each sub-vector independently against a k-means codebook of `2^nbits`
//! entries (clamped to the batch size). Codebooks are trained per call with a
//! fixed seed so that identical input produces identical output.
//!
//! ```text
//! [code u8][count u32][dim u32][nsub u16][nbits u8][k u32]
//! codebooks: for each sub-vector: k * subdim f32
//! [packed codes: count * nsub fields of nbits each]
//! ```

use super::{pack_bits, squared_distance, unpack_bits, ByteReader, CompressError, Method, MethodParams};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Fixed training seed: compression must be deterministic for a given batch.
const TRAIN_SEED: u64 = 0x76_65_63_6d_65_73_68; // "vecmesh"

/// Lloyd iterations; codebooks converge quickly on cache-sized batches.
const KMEANS_ITERS: usize = 12;

/// Contiguous sub-vector boundaries. When `dim % nsub != 0` the first
/// `dim % nsub` sub-vectors get one extra dimension.
pub(crate) fn split_ranges(dim: usize, nsub: usize) -> Vec<(usize, usize)> {
    let base = dim / nsub;
    let rem = dim % nsub;
    let mut ranges = Vec::with_capacity(nsub);
    let mut start = 0;
    for s in 0..nsub {
        let len = base + usize::from(s < rem);
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

/// Plain Lloyd k-means over `points`, returning `k` centroids.
///
/// Initial centroids are distinct samples; a cluster that empties out is
/// reseeded from the point farthest from its centroid.
pub(crate) fn kmeans(points: &[Vec<f32>], k: usize, iters: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let k = k.min(points.len()).max(1);
    let dim = points[0].len();

    let picks = rand::seq::index::sample(rng, points.len(), k);
    let mut centroids: Vec<Vec<f32>> = picks.iter().map(|i| points[i].clone()).collect();

    let mut assignments = vec![0usize; points.len()];
    for _ in 0..iters {
        let mut moved = false;
        for (i, point) in points.iter().enumerate() {
            let nearest = nearest_centroid(point, &centroids);
            if assignments[i] != nearest {
                assignments[i] = nearest;
                moved = true;
            }
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, point) in points.iter().enumerate() {
            let c = assignments[i];
            counts[c] += 1;
            for (j, &x) in point.iter().enumerate() {
                sums[c][j] += x;
            }
        }

        for c in 0..k {
            if counts[c] == 0 {
                // Reseed the empty cluster from the worst-fit point.
                let farthest = points
                    .iter()
                    .enumerate()
                    .max_by(|x, y| {
                        let dx = squared_distance(x.1, &centroids[assignments[x.0]]);
                        let dy = squared_distance(y.1, &centroids[assignments[y.0]]);
                        dx.partial_cmp(&dy).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                centroids[c] = points[farthest].clone();
                moved = true;
            } else {
                for j in 0..dim {
                    centroids[c][j] = sums[c][j] / counts[c] as f32;
                }
            }
        }

        if !moved {
            break;
        }
    }
    centroids
}

pub(crate) fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let dist = squared_distance(point, centroid);
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

pub(crate) fn encode(vectors: &[Vec<f32>], params: &MethodParams) -> Result<Vec<u8>, CompressError> {
    let count = vectors.len();
    let dim = vectors[0].len();
    let nsub = params.nsubvectors.min(dim);
    let nbits = params.nbits;
    let k = (1usize << nbits.min(31)).min(count);

    let ranges = split_ranges(dim, nsub);
    let mut rng = StdRng::seed_from_u64(TRAIN_SEED);

    let mut out = Vec::new();
    out.push(Method::ProductQuantization.code());
    out.extend_from_slice(&(count as u32).to_le_bytes());
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.extend_from_slice(&(nsub as u16).to_le_bytes());
    out.push(nbits);
    out.extend_from_slice(&(k as u32).to_le_bytes());

    let mut codes: Vec<u32> = vec![0; count * nsub];
    for (s, &(start, end)) in ranges.iter().enumerate() {
        let sub_points: Vec<Vec<f32>> = vectors.iter().map(|v| v[start..end].to_vec()).collect();
        let codebook = kmeans(&sub_points, k, KMEANS_ITERS, &mut rng);

        for centroid in &codebook {
            for &x in centroid {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        // Codebook may be smaller than k if the batch is tiny; pad so the
        // decoder can index by the header's k unconditionally.
        for _ in codebook.len()..k {
            for _ in start..end {
                out.extend_from_slice(&0.0f32.to_le_bytes());
            }
        }

        for (i, sub) in sub_points.iter().enumerate() {
            codes[i * nsub + s] = nearest_centroid(sub, &codebook) as u32;
        }
    }

    out.extend_from_slice(&pack_bits(&codes, nbits));
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Vec<Vec<f32>>, CompressError> {
    let mut reader = ByteReader::new(bytes);
    let method = Method::from_code(reader.u8()?)?;
    if method != Method::ProductQuantization {
        return Err(CompressError::UnsupportedMethod(format!(
            "payload encoded with {method}, expected pq"
        )));
    }

    let count = reader.u32()? as usize;
    let dim = reader.u32()? as usize;
    let nsub = reader.u16()? as usize;
    let nbits = reader.u8()?;
    let k = reader.u32()? as usize;
    if nsub == 0 || nsub > dim || nbits == 0 || nbits > 16 || k == 0 {
        return Err(CompressError::Corrupt("bad pq header".into()));
    }

    let ranges = split_ranges(dim, nsub);
    let mut codebooks: Vec<Vec<Vec<f32>>> = Vec::with_capacity(nsub);
    for &(start, end) in &ranges {
        let subdim = end - start;
        let mut codebook = Vec::with_capacity(k);
        for _ in 0..k {
            codebook.push(reader.f32_vec(subdim)?);
        }
        codebooks.push(codebook);
    }

    let codes = unpack_bits(reader.bytes(reader.remaining())?, nbits, count * nsub)?;

    let mut vectors = Vec::with_capacity(count);
    for i in 0..count {
        let mut v = vec![0.0f32; dim];
        for (s, &(start, end)) in ranges.iter().enumerate() {
            let code = codes[i * nsub + s] as usize;
            if code >= k {
                return Err(CompressError::Corrupt(format!(
                    "code {code} out of range (k={k})"
                )));
            }
            v[start..end].copy_from_slice(&codebooks[s][code]);
        }
        vectors.push(v);
    }
    Ok(vectors)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::cosine_similarity;

    fn batch(count: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..count)
            .map(|i| {
                (0..dim)
                    .map(|j| ((i * 17 + j * 41) % 89) as f32 / 89.0 - 0.5)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_split_ranges_even() {
        let ranges = split_ranges(16, 4);
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 12), (12, 16)]);
    }

    #[test]
    fn test_split_ranges_uneven() {
        let ranges = split_ranges(10, 4);
        assert_eq!(ranges, vec![(0, 3), (3, 6), (6, 8), (8, 10)]);
        assert_eq!(ranges.last().unwrap().1, 10);
    }

    #[test]
    fn test_kmeans_separates_clusters() {
        // Two obvious clusters around (0,0) and (10,10).
        let mut points = Vec::new();
        for i in 0..10 {
            let jitter = i as f32 * 0.01;
            points.push(vec![jitter, -jitter]);
            points.push(vec![10.0 + jitter, 10.0 - jitter]);
        }
        let mut rng = StdRng::seed_from_u64(7);
        let centroids = kmeans(&points, 2, 20, &mut rng);

        let d = squared_distance(&centroids[0], &centroids[1]);
        assert!(d > 50.0, "centroids should land in separate clusters: {d}");
    }

    #[test]
    fn test_encode_deterministic() {
        let vectors = batch(32, 24);
        let params = MethodParams::default();
        let a = encode(&vectors, &params).unwrap();
        let b = encode(&vectors, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_roundtrip_small_batch_exact() {
        // With count <= 2^nbits every vector gets its own centroid, so the
        // codebook converges onto the input and reconstruction is near-exact.
        let vectors = batch(4, 16);
        let encoded = encode(&vectors, &MethodParams::default()).unwrap();
        let decoded = decode(&encoded).unwrap();

        for (a, b) in vectors.iter().zip(decoded.iter()) {
            assert!(cosine_similarity(a, b) > 0.999);
        }
    }

    #[test]
    fn test_roundtrip_accuracy() {
        let vectors = batch(200, 32);
        let encoded = encode(&vectors, &MethodParams::default()).unwrap();
        let decoded = decode(&encoded).unwrap();

        let mean: f32 = vectors
            .iter()
            .zip(decoded.iter())
            .map(|(a, b)| cosine_similarity(a, b))
            .sum::<f32>()
            / vectors.len() as f32;
        assert!(mean > 0.9, "mean cosine similarity too low: {mean}");
    }

    #[test]
    fn test_compresses_large_batches() {
        // 64 codebook entries keep the codebook overhead well under the
        // payload so the batch shrinks decisively.
        let vectors = batch(500, 64);
        let params = MethodParams {
            nbits: 6,
            ..Default::default()
        };
        let encoded = encode(&vectors, &params).unwrap();
        assert!(encoded.len() < 500 * 64 * 4 / 4);
    }

    #[test]
    fn test_decode_wrong_codec() {
        let vectors = batch(4, 8);
        let mut encoded = encode(&vectors, &MethodParams::default()).unwrap();
        encoded[0] = Method::ScalarQuantization.code();
        assert!(matches!(
            decode(&encoded),
            Err(CompressError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let vectors = batch(8, 16);
        let encoded = encode(&vectors, &MethodParams::default()).unwrap();
        assert!(matches!(
            decode(&encoded[..20]),
            Err(CompressError::Corrupt(_))
        ));
    }
}
