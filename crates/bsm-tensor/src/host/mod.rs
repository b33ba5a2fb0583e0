use log::trace;

use crate::backend::ArrayBackend;
use crate::device::{Device, Stream};
use crate::error::{Result, TensorError};

/// Pure-Rust array runtime that executes every primitive on host memory.
///
/// Device tags are kept for placement bookkeeping only; all buffers live in
/// host memory and every stream is already synchronized. Intended as a
/// reference implementation and for tests.
#[derive(Debug, Clone)]
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        HostBackend
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn current_stream(&self, device: Device) -> Stream {
        Stream::default_for(device)
    }

    fn synchronize(&self, stream: &Stream) -> Result<()> {
        trace!("synchronize {} stream {}", stream.device, stream.id);
        Ok(())
    }

    fn histc(&self, values: &[i64], bins: usize, min: i64, max: i64) -> Result<Vec<i64>> {
        if bins == 0 {
            return Err(TensorError::Other("histc: bins must be positive".to_string()));
        }
        if max <= min {
            return Err(TensorError::Other(format!(
                "histc: empty range [{}, {}]",
                min, max
            )));
        }
        let width = (max - min) as i128;
        let mut hist = vec![0i64; bins];
        for &v in values {
            if v < min || v > max {
                continue;
            }
            let bin = if v == max {
                bins - 1
            } else {
                ((v - min) as i128 * bins as i128 / width) as usize
            };
            hist[bin] += 1;
        }
        Ok(hist)
    }

    fn cumsum(&self, values: &[i64]) -> Result<Vec<i64>> {
        let mut acc = 0i64;
        Ok(values
            .iter()
            .map(|&v| {
                acc += v;
                acc
            })
            .collect())
    }

    fn argsort(&self, keys: &[i64]) -> Result<Vec<i64>> {
        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_unstable_by_key(|&i| keys[i]);
        Ok(order.into_iter().map(|i| i as i64).collect())
    }

    fn gather(&self, values: &[i64], index: &[i64]) -> Result<Vec<i64>> {
        index
            .iter()
            .map(|&i| {
                usize::try_from(i)
                    .ok()
                    .and_then(|i| values.get(i).copied())
                    .ok_or(TensorError::IndexOutOfBounds {
                        index: i.max(0) as usize,
                        len: values.len(),
                    })
            })
            .collect()
    }

    fn linspace(&self, start: i64, end: i64, steps: usize) -> Result<Vec<i64>> {
        match steps {
            0 => Ok(vec![]),
            1 => Ok(vec![start]),
            _ => {
                let span = (end - start) as i128;
                let last = (steps - 1) as i128;
                Ok((0..steps)
                    .map(|i| start + (span * i as i128 / last) as i64)
                    .collect())
            }
        }
    }

    fn repeat_interleave(&self, counts: &[i64]) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        for (i, &c) in counts.iter().enumerate() {
            if c < 0 {
                return Err(TensorError::Other(format!(
                    "repeat_interleave: negative count {} at position {}",
                    c, i
                )));
            }
            out.extend(std::iter::repeat(i as i64).take(c as usize));
        }
        Ok(out)
    }

    fn add(&self, a: &[i64], b: &[i64]) -> Result<Vec<i64>> {
        if a.len() != b.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![a.len()],
                got: vec![b.len()],
            });
        }
        Ok(a.iter().zip(b.iter()).map(|(x, y)| x + y).collect())
    }

    fn mul_scalar(&self, a: &[i64], s: i64) -> Result<Vec<i64>> {
        Ok(a.iter().map(|x| x * s).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histc_unit_bins() {
        let b = HostBackend::new();
        let h = b.histc(&[1, 0, 1, 3], 4, 0, 4).unwrap();
        assert_eq!(h, vec![1, 2, 0, 1]);
    }

    #[test]
    fn test_histc_max_in_last_bin() {
        let b = HostBackend::new();
        let h = b.histc(&[0, 4, 5, -1], 2, 0, 4).unwrap();
        assert_eq!(h, vec![1, 1]);
    }

    #[test]
    fn test_histc_bad_range() {
        let b = HostBackend::new();
        assert!(b.histc(&[0], 0, 0, 1).is_err());
        assert!(b.histc(&[0], 1, 2, 2).is_err());
    }

    #[test]
    fn test_cumsum() {
        let b = HostBackend::new();
        assert_eq!(b.cumsum(&[1, 0, 2, 3]).unwrap(), vec![1, 1, 3, 6]);
        assert!(b.cumsum(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_argsort() {
        let b = HostBackend::new();
        assert_eq!(b.argsort(&[30, 10, 20]).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_gather() {
        let b = HostBackend::new();
        assert_eq!(b.gather(&[5, 6, 7], &[2, 0]).unwrap(), vec![7, 5]);
        assert!(b.gather(&[5], &[1]).is_err());
        assert!(b.gather(&[5], &[-1]).is_err());
    }

    #[test]
    fn test_linspace() {
        let b = HostBackend::new();
        assert_eq!(b.linspace(0, 64, 3).unwrap(), vec![0, 32, 64]);
        assert_eq!(b.linspace(7, 7, 1).unwrap(), vec![7]);
        assert!(b.linspace(0, 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_repeat_interleave() {
        let b = HostBackend::new();
        assert_eq!(b.repeat_interleave(&[2, 0, 1]).unwrap(), vec![0, 0, 2]);
        assert!(b.repeat_interleave(&[-1]).is_err());
    }

    #[test]
    fn test_add_mul() {
        let b = HostBackend::new();
        assert_eq!(b.add(&[1, 2], &[3, 4]).unwrap(), vec![4, 6]);
        assert!(b.add(&[1], &[1, 2]).is_err());
        assert_eq!(b.mul_scalar(&[1, 2], 3).unwrap(), vec![3, 6]);
    }
}
