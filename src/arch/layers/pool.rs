use ndarray::{Array2, Array3, Array4, ArrayView3, Axis, stack};
use rayon::prelude::*;

use crate::error::{Result, RetrainErr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    /// Average pooling, optionally counting the zero padding in the divisor.
    Avg { count_include_pad: bool },
}

/// The forward metadata a `Pool2d` needs for its backward pass.
#[derive(Debug, Clone)]
pub struct PoolCache {
    in_dim: (usize, usize, usize, usize),
    argmax: Option<Array4<usize>>,
}

/// 2D max/average pooling.
#[derive(Debug, Clone, Copy)]
pub struct Pool2d {
    kind: PoolKind,
    kernel: usize,
    stride: usize,
    padding: usize,
}

/// A pooling window, already clipped to the input.
struct Window {
    rows: std::ops::Range<usize>,
    cols: std::ops::Range<usize>,
    divisor: f32,
}

impl Pool2d {
    pub fn new(kind: PoolKind, kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kind,
            kernel,
            stride,
            padding,
        }
    }

    pub fn max(kernel: usize, stride: usize, padding: usize) -> Self {
        Self::new(PoolKind::Max, kernel, stride, padding)
    }

    /// Average pooling that excludes padding from the divisor.
    pub fn avg(kernel: usize, stride: usize, padding: usize) -> Self {
        let kind = PoolKind::Avg {
            count_include_pad: false,
        };

        Self::new(kind, kernel, stride, padding)
    }

    fn out_dim(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        let side = |len: usize| {
            let padded = len + 2 * self.padding;
            if padded < self.kernel {
                return Err(RetrainErr::SizeMismatch {
                    what: "pooling input side",
                    got: len,
                    expected: self.kernel,
                });
            }

            Ok((padded - self.kernel) / self.stride + 1)
        };

        Ok((side(h)?, side(w)?))
    }

    fn window(&self, oy: usize, ox: usize, h: usize, w: usize) -> Window {
        let (k, s, p) = (self.kernel as isize, self.stride as isize, self.padding as isize);
        let y0 = oy as isize * s - p;
        let x0 = ox as isize * s - p;
        let y1 = (y0 + k).min(h as isize + p);
        let x1 = (x0 + k).min(w as isize + p);
        let padded_area = ((y1 - y0) * (x1 - x0)) as f32;

        let rows = y0.max(0) as usize..(y1.min(h as isize)) as usize;
        let cols = x0.max(0) as usize..(x1.min(w as isize)) as usize;
        let area = (rows.len() * cols.len()) as f32;

        let divisor = match self.kind {
            PoolKind::Avg {
                count_include_pad: true,
            } => padded_area,
            _ => area,
        };

        Window {
            rows,
            cols,
            divisor,
        }
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<(Array4<f32>, PoolCache)> {
        let (n, _, h, w) = x.dim();
        let (ho, wo) = self.out_dim(h, w)?;

        let per_sample: Vec<(Array3<f32>, Array3<usize>)> = (0..n)
            .into_par_iter()
            .map(|i| self.pool_sample(x.index_axis(Axis(0), i), ho, wo))
            .collect();

        let outs: Vec<_> = per_sample.iter().map(|(o, _)| o.view()).collect();
        let out = stack(Axis(0), &outs)?;

        let argmax = match self.kind {
            PoolKind::Max => {
                let idx: Vec<_> = per_sample.iter().map(|(_, a)| a.view()).collect();
                Some(stack(Axis(0), &idx)?)
            }
            PoolKind::Avg { .. } => None,
        };

        let cache = PoolCache {
            in_dim: x.dim(),
            argmax,
        };

        Ok((out, cache))
    }

    fn pool_sample(&self, x: ArrayView3<f32>, ho: usize, wo: usize) -> (Array3<f32>, Array3<usize>) {
        let (c, h, w) = x.dim();
        let mut out = Array3::zeros((c, ho, wo));
        let mut argmax = Array3::zeros((c, ho, wo));

        for ch in 0..c {
            for oy in 0..ho {
                for ox in 0..wo {
                    let win = self.window(oy, ox, h, w);
                    match self.kind {
                        PoolKind::Max => {
                            let mut best = f32::NEG_INFINITY;
                            let mut best_idx = win.rows.start * w + win.cols.start;
                            for y in win.rows.clone() {
                                for xx in win.cols.clone() {
                                    let v = x[[ch, y, xx]];
                                    if v > best {
                                        best = v;
                                        best_idx = y * w + xx;
                                    }
                                }
                            }
                            out[[ch, oy, ox]] = best;
                            argmax[[ch, oy, ox]] = best_idx;
                        }
                        PoolKind::Avg { .. } => {
                            let mut sum = 0.0;
                            for y in win.rows.clone() {
                                for xx in win.cols.clone() {
                                    sum += x[[ch, y, xx]];
                                }
                            }
                            out[[ch, oy, ox]] = sum / win.divisor;
                        }
                    }
                }
            }
        }

        (out, argmax)
    }

    pub fn backward(&self, cache: &PoolCache, d: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = cache.in_dim;
        let (_, _, ho, wo) = d.dim();
        let mut dx = Array4::zeros(cache.in_dim);

        for i in 0..n {
            for ch in 0..c {
                for oy in 0..ho {
                    for ox in 0..wo {
                        let g = d[[i, ch, oy, ox]];
                        match &cache.argmax {
                            Some(argmax) => {
                                let idx = argmax[[i, ch, oy, ox]];
                                dx[[i, ch, idx / w, idx % w]] += g;
                            }
                            None => {
                                let win = self.window(oy, ox, h, w);
                                let share = g / win.divisor;
                                for y in win.rows.clone() {
                                    for xx in win.cols.clone() {
                                        dx[[i, ch, y, xx]] += share;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(dx)
    }
}

/// Averages every channel down to a single value, `(n, c, h, w) -> (n, c)`.
pub fn global_avg_pool(x: &Array4<f32>) -> Array2<f32> {
    let (_, _, h, w) = x.dim();
    x.sum_axis(Axis(3)).sum_axis(Axis(2)) / (h * w) as f32
}

/// The backward pass of `global_avg_pool` for an input of size `(h, w)`.
pub fn global_avg_pool_backward(d: &Array2<f32>, h: usize, w: usize) -> Array4<f32> {
    let (n, c) = d.dim();
    let scale = 1.0 / (h * w) as f32;
    let mut dx = Array4::zeros((n, c, h, w));
    for ((i, ch), &g) in d.indexed_iter() {
        dx.slice_mut(ndarray::s![i, ch, .., ..]).fill(g * scale);
    }

    dx
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, array};

    use super::*;

    fn plane() -> Array4<f32> {
        Array::from_iter((0..16).map(|i| i as f32))
            .into_shape_with_order((1, 1, 4, 4))
            .unwrap()
    }

    #[test]
    fn max_pool_routes_gradient_to_argmax() {
        let pool = Pool2d::max(2, 2, 0);
        let (out, cache) = pool.forward(&plane()).unwrap();
        assert_eq!(out.into_shape_with_order((2, 2)).unwrap(), array![[5.0, 7.0], [13.0, 15.0]]);

        let dx = pool.backward(&cache, &Array4::ones((1, 1, 2, 2))).unwrap();
        assert_eq!(dx.sum(), 4.0);
        assert_eq!(dx[[0, 0, 1, 1]], 1.0);
        assert_eq!(dx[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn avg_pool_excludes_padding_by_default() {
        let pool = Pool2d::avg(3, 1, 1);
        let x = Array4::ones((1, 1, 3, 3));
        let (out, _) = pool.forward(&x).unwrap();
        assert!(out.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn avg_pool_can_count_padding() {
        let kind = PoolKind::Avg {
            count_include_pad: true,
        };
        let pool = Pool2d::new(kind, 3, 1, 1);
        let (out, cache) = pool.forward(&Array4::ones((1, 1, 3, 3))).unwrap();
        assert!((out[[0, 0, 0, 0]] - 4.0 / 9.0).abs() < 1e-6);
        assert!((out[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);

        let dx = pool.backward(&cache, &Array4::ones((1, 1, 3, 3))).unwrap();
        assert!((dx.sum() - out.sum()).abs() < 1e-5);
    }

    #[test]
    fn global_pool_round_trips_gradient_mass() {
        let x = plane();
        let pooled = global_avg_pool(&x);
        assert_eq!(pooled, array![[7.5]]);

        let dx = global_avg_pool_backward(&array![[2.0]], 4, 4);
        assert!((dx.sum() - 2.0).abs() < 1e-6);
    }
}
