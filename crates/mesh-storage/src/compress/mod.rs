//! Lossy vector compression codecs.
//!
//! Turns a batch of vectors into a compact byte encoding and back, selecting
//! among quantization methods:
//!
//! | Method | Encoding | Typical use |
//! |--------|----------|-------------|
//! | SQ     | per-vector min/step linear quantization    | small dimensions, single entries |
//! | PQ     | per-subvector k-means codebooks            | dim >= 256       |
//! | IVF-PQ | coarse clusters + PQ over residuals        | dim >= 512, large datasets |
//!
//! The engine is stateless per call: codebooks and quantization parameters
//! are embedded in the encoded bytes, so decoding needs only the codec
//! identifier and the payload. Reconstruction accuracy (mean cosine
//! similarity) is measured on every compress call and reported, never thrown.

mod ivf;
mod pq;
mod sq;

use crate::events::{Event, EventSink, NullSink};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Compression errors. `InvalidInput` and `UnsupportedMethod` indicate caller
/// bugs; `Corrupt` indicates a damaged payload.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported compression method: {0}")]
    UnsupportedMethod(String),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

// =============================================================================
// Methods and parameters
// =============================================================================

/// Quantization method, doubling as the codec identifier stored next to
/// compressed payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Scalar quantization: each dimension quantized independently.
    ScalarQuantization,
    /// Product quantization: contiguous sub-vectors quantized via codebooks.
    ProductQuantization,
    /// Inverted-file PQ: coarse cluster assignment plus PQ-encoded residuals.
    IvfProductQuantization,
}

impl Method {
    /// Minimum vector dimension for this method to be applicable.
    pub fn min_dimension(&self) -> usize {
        match self {
            Method::ScalarQuantization => 1,
            Method::ProductQuantization => 256,
            Method::IvfProductQuantization => 512,
        }
    }

    /// Minimum dataset size in megabytes for this method to be applicable.
    pub fn min_dataset_mb(&self) -> f64 {
        match self {
            Method::IvfProductQuantization => 1000.0,
            _ => 0.0,
        }
    }

    /// Whether this method applies to the given batch shape.
    pub fn applicable(&self, dimension: usize, dataset_mb: f64) -> bool {
        dimension >= self.min_dimension() && dataset_mb >= self.min_dataset_mb()
    }

    /// Automatic method selection for a batch shape.
    pub fn auto_select(dimension: usize, dataset_mb: f64) -> Method {
        if Method::IvfProductQuantization.applicable(dimension, dataset_mb) {
            Method::IvfProductQuantization
        } else if Method::ProductQuantization.applicable(dimension, dataset_mb) {
            Method::ProductQuantization
        } else {
            Method::ScalarQuantization
        }
    }

    /// One-byte wire code embedded in encoded payloads.
    pub(crate) fn code(&self) -> u8 {
        match self {
            Method::ScalarQuantization => 1,
            Method::ProductQuantization => 2,
            Method::IvfProductQuantization => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Method, CompressError> {
        match code {
            1 => Ok(Method::ScalarQuantization),
            2 => Ok(Method::ProductQuantization),
            3 => Ok(Method::IvfProductQuantization),
            other => Err(CompressError::Corrupt(format!(
                "unknown codec code {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::ScalarQuantization => write!(f, "sq"),
            Method::ProductQuantization => write!(f, "pq"),
            Method::IvfProductQuantization => write!(f, "ivf_pq"),
        }
    }
}

impl FromStr for Method {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sq" | "scalar" => Ok(Method::ScalarQuantization),
            "pq" | "product" => Ok(Method::ProductQuantization),
            "ivf_pq" | "ivfpq" | "ivf" => Ok(Method::IvfProductQuantization),
            other => Err(CompressError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Tunable parameters shared by all methods. Methods ignore the fields they
/// do not use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MethodParams {
    /// Number of contiguous sub-vectors for PQ / IVF-PQ.
    pub nsubvectors: usize,
    /// Bits per quantized value (1..=16).
    pub nbits: u8,
    /// Number of coarse clusters for IVF-PQ.
    pub nlist: usize,
}

impl Default for MethodParams {
    fn default() -> Self {
        Self {
            nsubvectors: 8,
            nbits: 8,
            nlist: 16,
        }
    }
}

impl MethodParams {
    /// Validates the fields the chosen method will actually use.
    pub(crate) fn validate(&self, method: Method, dimension: usize) -> Result<(), CompressError> {
        if self.nbits == 0 || self.nbits > 16 {
            return Err(CompressError::InvalidInput(format!(
                "nbits must be in 1..=16, got {}",
                self.nbits
            )));
        }
        if method != Method::ScalarQuantization
            && (self.nsubvectors == 0 || self.nsubvectors > dimension)
        {
            return Err(CompressError::InvalidInput(format!(
                "nsubvectors must be in 1..=dimension ({dimension}), got {}",
                self.nsubvectors
            )));
        }
        if method == Method::IvfProductQuantization && self.nlist == 0 {
            return Err(CompressError::InvalidInput("nlist must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Results and metrics
// =============================================================================

/// A compressed batch: codec identifier plus the self-describing payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoded {
    /// Codec that produced `bytes`.
    pub method: Method,
    /// Self-describing payload (header, parameters, codebooks, codes).
    pub bytes: Vec<u8>,
}

/// Metrics for one compress call, retained per method (last-write-wins).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodecReport {
    /// Method that produced this report.
    pub method: Method,
    /// Raw f32 size of the input batch.
    pub original_bytes: usize,
    /// Encoded payload size.
    pub compressed_bytes: usize,
    /// Exactly `original_bytes / compressed_bytes`.
    pub ratio: f32,
    /// Mean cosine similarity between original and reconstructed vectors.
    pub accuracy: f32,
    /// Throughput of the encode pass.
    pub vectors_per_sec: f64,
}

// =============================================================================
// Compressor
// =============================================================================

/// Stateless-per-call codec engine with per-method metric retention.
pub struct Compressor {
    /// Accuracy floor below which a `compression_degraded` event is emitted.
    min_accuracy: f32,
    /// Latest report per method.
    reports: DashMap<Method, CodecReport>,
    events: Arc<dyn EventSink>,
}

impl Compressor {
    /// Creates a compressor with the given accuracy floor.
    pub fn new(min_accuracy: f32, events: Arc<dyn EventSink>) -> Self {
        Self {
            min_accuracy,
            reports: DashMap::new(),
            events,
        }
    }

    /// Creates a compressor with the default 0.9 accuracy floor and no sink.
    pub fn with_defaults() -> Self {
        Self::new(0.9, Arc::new(NullSink))
    }

    /// Returns the configured accuracy floor.
    pub fn min_accuracy(&self) -> f32 {
        self.min_accuracy
    }

    /// Compresses a batch of vectors.
    ///
    /// When `method` is `None`, selection is automatic: dimension >= 512 and
    /// dataset >= 1000 MB chooses IVF-PQ, dimension >= 256 chooses PQ,
    /// anything else SQ. An explicit method that does not meet its dimension
    /// floor falls through to the encoder anyway; applicability gates only
    /// automatic selection.
    ///
    /// Fails with `InvalidInput` on an empty batch or ragged dimensions.
    pub fn compress(
        &self,
        vectors: &[Vec<f32>],
        method: Option<Method>,
        params: &MethodParams,
    ) -> Result<(Encoded, CodecReport), CompressError> {
        let dimension = batch_dimension(vectors)?;
        let original_bytes = vectors.len() * dimension * 4;
        let dataset_mb = original_bytes as f64 / 1_000_000.0;

        let method = method.unwrap_or_else(|| Method::auto_select(dimension, dataset_mb));
        params.validate(method, dimension)?;

        let start = Instant::now();
        let bytes = match method {
            Method::ScalarQuantization => sq::encode(vectors, params)?,
            Method::ProductQuantization => pq::encode(vectors, params)?,
            Method::IvfProductQuantization => ivf::encode(vectors, params)?,
        };
        let elapsed = start.elapsed().as_secs_f64().max(1e-9);

        // Measure reconstruction quality on the round trip.
        let reconstructed = self.decompress(method, &bytes)?;
        let accuracy = mean_cosine_similarity(vectors, &reconstructed);

        let report = CodecReport {
            method,
            original_bytes,
            compressed_bytes: bytes.len(),
            ratio: original_bytes as f32 / bytes.len() as f32,
            accuracy,
            vectors_per_sec: vectors.len() as f64 / elapsed,
        };

        if accuracy < self.min_accuracy {
            self.events.emit(Event::CompressionDegraded {
                method: method.to_string(),
                accuracy,
                min_accuracy: self.min_accuracy,
            });
        }

        self.reports.insert(method, report.clone());
        Ok((Encoded { method, bytes }, report))
    }

    /// Decompresses a payload produced by [`Compressor::compress`].
    pub fn decompress(&self, method: Method, bytes: &[u8]) -> Result<Vec<Vec<f32>>, CompressError> {
        match method {
            Method::ScalarQuantization => sq::decode(bytes),
            Method::ProductQuantization => pq::decode(bytes),
            Method::IvfProductQuantization => ivf::decode(bytes),
        }
    }

    /// Returns the latest report for a method, if any compress call used it.
    pub fn report(&self, method: Method) -> Option<CodecReport> {
        self.reports.get(&method).map(|r| r.value().clone())
    }

    /// Mean compression ratio across methods with retained reports.
    ///
    /// Returns 1.0 when nothing has been compressed yet, so the governor's
    /// snapshot stays meaningful before first use.
    pub fn average_ratio(&self) -> f32 {
        let mut sum = 0.0f32;
        let mut n = 0usize;
        for entry in self.reports.iter() {
            sum += entry.value().ratio;
            n += 1;
        }
        if n == 0 {
            1.0
        } else {
            sum / n as f32
        }
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("min_accuracy", &self.min_accuracy)
            .field("methods_reported", &self.reports.len())
            .finish()
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Validates batch shape and returns its dimension.
fn batch_dimension(vectors: &[Vec<f32>]) -> Result<usize, CompressError> {
    let first = vectors
        .first()
        .ok_or_else(|| CompressError::InvalidInput("empty vector batch".into()))?;
    let dimension = first.len();
    if dimension == 0 {
        return Err(CompressError::InvalidInput("zero-dimensional vectors".into()));
    }
    for v in vectors {
        if v.len() != dimension {
            return Err(CompressError::DimensionMismatch {
                expected: dimension,
                got: v.len(),
            });
        }
    }
    Ok(dimension)
}

/// Computes the cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn mean_cosine_similarity(original: &[Vec<f32>], reconstructed: &[Vec<f32>]) -> f32 {
    if original.is_empty() {
        return 0.0;
    }
    let sum: f32 = original
        .iter()
        .zip(reconstructed.iter())
        .map(|(a, b)| cosine_similarity(a, b))
        .sum();
    sum / original.len() as f32
}

/// Squared Euclidean distance; codecs only compare, so the sqrt is skipped.
pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Sequential little-endian reader over an encoded payload.
///
/// Overruns surface as `Corrupt`, never panics.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CompressError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| CompressError::Corrupt("payload truncated".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, CompressError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CompressError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, CompressError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32, CompressError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>, CompressError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.f32()?);
        }
        Ok(out)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CompressError> {
        self.take(n)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Packs `values` as consecutive `nbits`-wide fields, LSB-first.
pub(crate) fn pack_bits(values: &[u32], nbits: u8) -> Vec<u8> {
    let nbits = nbits as u64;
    let total_bits = values.len() as u64 * nbits;
    let mut out = vec![0u8; total_bits.div_ceil(8) as usize];

    let mut bit_pos = 0u64;
    for &value in values {
        let mut v = value as u64 & ((1u64 << nbits) - 1);
        let mut remaining = nbits;
        while remaining > 0 {
            let byte = (bit_pos / 8) as usize;
            let offset = bit_pos % 8;
            let writable = (8 - offset).min(remaining);
            out[byte] |= ((v & ((1u64 << writable) - 1)) << offset) as u8;
            v >>= writable;
            bit_pos += writable;
            remaining -= writable;
        }
    }
    out
}

/// Inverse of [`pack_bits`].
pub(crate) fn unpack_bits(bytes: &[u8], nbits: u8, count: usize) -> Result<Vec<u32>, CompressError> {
    let nbits = nbits as u64;
    let needed_bits = count as u64 * nbits;
    if (bytes.len() as u64) * 8 < needed_bits {
        return Err(CompressError::Corrupt("bit stream truncated".into()));
    }

    let mut out = Vec::with_capacity(count);
    let mut bit_pos = 0u64;
    for _ in 0..count {
        let mut v = 0u64;
        let mut filled = 0u64;
        while filled < nbits {
            let byte = bytes[(bit_pos / 8) as usize] as u64;
            let offset = bit_pos % 8;
            let readable = (8 - offset).min(nbits - filled);
            let chunk = (byte >> offset) & ((1u64 << readable) - 1);
            v |= chunk << filled;
            filled += readable;
            bit_pos += readable;
        }
        out.push(v as u32);
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(count: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..count)
            .map(|i| {
                (0..dim)
                    .map(|j| ((i * 31 + j * 7) % 97) as f32 / 97.0 - 0.5)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_auto_select_thresholds() {
        assert_eq!(Method::auto_select(64, 1.0), Method::ScalarQuantization);
        assert_eq!(Method::auto_select(256, 1.0), Method::ProductQuantization);
        assert_eq!(Method::auto_select(512, 10.0), Method::ProductQuantization);
        assert_eq!(
            Method::auto_select(512, 1500.0),
            Method::IvfProductQuantization
        );
        assert_eq!(Method::auto_select(768, 2000.0), Method::IvfProductQuantization);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("sq".parse::<Method>().unwrap(), Method::ScalarQuantization);
        assert_eq!("pq".parse::<Method>().unwrap(), Method::ProductQuantization);
        assert_eq!(
            "ivf_pq".parse::<Method>().unwrap(),
            Method::IvfProductQuantization
        );
        assert!(matches!(
            "lz4".parse::<Method>(),
            Err(CompressError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let compressor = Compressor::with_defaults();
        let result = compressor.compress(&[], None, &MethodParams::default());
        assert!(matches!(result, Err(CompressError::InvalidInput(_))));
    }

    #[test]
    fn test_ragged_batch_rejected() {
        let compressor = Compressor::with_defaults();
        let vectors = vec![vec![1.0, 2.0], vec![1.0, 2.0, 3.0]];
        let result = compressor.compress(&vectors, None, &MethodParams::default());
        assert!(matches!(
            result,
            Err(CompressError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_ratio_is_exact_quotient() {
        let compressor = Compressor::with_defaults();
        let vectors = batch(32, 64);
        let (encoded, report) = compressor
            .compress(&vectors, Some(Method::ScalarQuantization), &MethodParams::default())
            .unwrap();

        let original = 32 * 64 * 4;
        assert_eq!(report.original_bytes, original);
        assert_eq!(report.compressed_bytes, encoded.bytes.len());
        assert_eq!(
            report.ratio,
            original as f32 / encoded.bytes.len() as f32
        );
        assert!(report.ratio > 1.0);
    }

    #[test]
    fn test_report_retained_per_method() {
        let compressor = Compressor::with_defaults();
        let vectors = batch(16, 32);
        compressor
            .compress(&vectors, Some(Method::ScalarQuantization), &MethodParams::default())
            .unwrap();

        assert!(compressor.report(Method::ScalarQuantization).is_some());
        assert!(compressor.report(Method::ProductQuantization).is_none());
        assert!(compressor.average_ratio() > 1.0);
    }

    #[test]
    fn test_average_ratio_default() {
        let compressor = Compressor::with_defaults();
        assert_eq!(compressor.average_ratio(), 1.0);
    }

    #[test]
    fn test_degraded_event_on_low_accuracy() {
        use crate::events::MemorySink;

        // An impossible accuracy floor forces the degraded event.
        let sink = MemorySink::shared();
        let compressor = Compressor::new(1.01, sink.clone());
        let vectors = batch(8, 16);
        compressor
            .compress(&vectors, Some(Method::ScalarQuantization), &MethodParams::default())
            .unwrap();

        assert_eq!(sink.count("compression_degraded"), 1);
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        for nbits in [1u8, 3, 5, 8, 11, 16] {
            let max = (1u64 << nbits) - 1;
            let values: Vec<u32> = (0..100u64).map(|i| ((i * 37) % (max + 1)) as u32).collect();
            let packed = pack_bits(&values, nbits);
            let unpacked = unpack_bits(&packed, nbits, values.len()).unwrap();
            assert_eq!(unpacked, values, "nbits={nbits}");
        }
    }

    #[test]
    fn test_unpack_truncated() {
        let packed = pack_bits(&[1, 2, 3], 8);
        assert!(matches!(
            unpack_bits(&packed, 8, 4),
            Err(CompressError::Corrupt(_))
        ));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
