//! Bloom filter sizing from a target false-positive probability.

use crate::error::{Result, SiftError};

/// Bits per element for `num_hashes` hash functions and target
/// false-positive probability `fp`: `-h / ln(1 - fp^(1/h))`.
pub fn bits_per_element(num_hashes: u32, fp: f64) -> Result<f64> {
    if num_hashes < 1 {
        return Err(SiftError::invalid(format!(
            "num_hashes must be >= 1 (got {})",
            num_hashes
        )));
    }
    if !(fp > 0.0 && fp < 1.0) {
        return Err(SiftError::invalid(format!(
            "false-positive probability must be in (0, 1) (got {})",
            fp
        )));
    }

    let h = f64::from(num_hashes);
    let denominator = (1.0 - fp.powf(1.0 / h)).ln();
    let ratio = -h / denominator;
    if !ratio.is_finite() || ratio <= 0.0 {
        return Err(SiftError::invalid(format!(
            "degenerate filter sizing for num_hashes={} fp={}",
            num_hashes, fp
        )));
    }
    Ok(ratio)
}

/// Filter bit length for `num_elements` elements: `ceil(n * m/n)`.
pub fn signature_size(num_elements: u64, num_hashes: u32, fp: f64) -> Result<u64> {
    if num_elements < 1 {
        return Err(SiftError::invalid(format!(
            "num_elements must be >= 1 (got {})",
            num_elements
        )));
    }
    let ratio = bits_per_element(num_hashes, fp)?;
    Ok((num_elements as f64 * ratio).ceil() as u64)
}
