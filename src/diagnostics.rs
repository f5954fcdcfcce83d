//! Mixing diagnostics for a single chain: split R-hat and effective sample
//! size following the STAN reference formulations, plus a five-number
//! summary for log lines.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rustfft::{num_complex::Complex, FftPlanner};
use std::fmt;

/// Per-parameter split R-hat and ESS for one chain.
#[derive(Debug, Clone)]
pub struct ChainDiagnostics {
    pub rhat: Array1<f64>,
    pub ess: Array1<f64>,
}

impl ChainDiagnostics {
    pub fn max_rhat(&self) -> f64 {
        *self.rhat.max_skipnan()
    }

    pub fn min_ess(&self) -> f64 {
        *self.ess.min_skipnan()
    }
}

impl fmt::Display for ChainDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "split R-hat in [{:.3}, {:.3}], ESS in [{:.0}, {:.0}]",
            *self.rhat.min_skipnan(),
            self.max_rhat(),
            self.min_ess(),
            *self.ess.max_skipnan(),
        )
    }
}

/// Splits one chain in half and treats the halves as independent chains.
///
/// # Arguments
/// - `sample`: observations with shape `(steps, parameters)`; needs at least
///   four steps for the split statistics to be defined.
pub fn split_diagnostics(sample: ArrayView2<f64>) -> ChainDiagnostics {
    let n = sample.nrows();
    let d = sample.ncols();
    assert!(n >= 4, "split diagnostics need at least four observations");

    let half = n / 2;
    let halves = [
        sample.slice(s![..half, ..]),
        sample.slice(s![(n - half).., ..]),
    ];

    // Average autocovariance of the two halves, each centered on its own mean.
    let acov = {
        let mut acc = autocov(halves[0]);
        acc += &autocov(halves[1]);
        acc.mapv_inplace(|v| v * 0.5);
        acc
    };

    let mut rhat = Array1::zeros(d);
    let mut ess = Array1::zeros(d);
    for p in 0..d {
        let m0 = halves[0].column(p).mean().unwrap_or(0.0);
        let m1 = halves[1].column(p).mean().unwrap_or(0.0);
        let overall = 0.5 * (m0 + m1);
        let between = half as f64 * ((m0 - overall).powi(2) + (m1 - overall).powi(2));
        let within = 0.5 * (halves[0].column(p).var(0.0) + halves[1].column(p).var(0.0));
        let var = (half as f64 - 1.0) / half as f64 * within + between / half as f64;
        rhat[p] = (var / within).sqrt();

        // Geyer initial-monotone truncation of the autocorrelation sum.
        let mut tau = -1.0;
        let mut floor = f64::INFINITY;
        let mut t = 0;
        while t + 1 < half {
            let rho_a = 1.0 - (within - acov[[t, p]]) / var;
            let rho_b = 1.0 - (within - acov[[t + 1, p]]) / var;
            let mut pair = rho_a + rho_b;
            if pair <= 0.0 {
                break;
            }
            if pair > floor {
                pair = floor;
            }
            floor = pair;
            tau += 2.0 * pair;
            t += 2;
        }
        let total = (2 * half) as f64;
        ess[p] = (total / tau).clamp(0.0, total);
    }

    ChainDiagnostics { rhat, ess }
}

/// Five-number summary of one scalar series.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub name: String,
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in [{:.3}, {:.3}], median {:.3}, mean {:.3} +/- {:.3}",
            self.name, self.min, self.max, self.median, self.mean, self.std
        )
    }
}

/// Summarises a non-empty series; the median is the upper middle element.
pub fn summarize(name: &str, data: ArrayView1<f64>) -> Summary {
    assert!(!data.is_empty(), "cannot summarise an empty series");
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Summary {
        name: name.to_string(),
        min: sorted[0],
        median: sorted[sorted.len() / 2],
        max: sorted[sorted.len() - 1],
        mean: data.mean().unwrap_or(0.0),
        std: data.std(1.0),
    }
}

fn autocov(sample: ArrayView2<f64>) -> Array2<f64> {
    if sample.nrows() <= 100 {
        autocov_bf(sample)
    } else {
        autocov_fft(sample)
    }
}

/// Autocovariance of each column by brute force, centered, normalised by the
/// sequence length.
fn autocov_bf(sample: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = sample.dim();
    let mut out = Array2::zeros((n, d));
    for p in 0..d {
        let col = sample.column(p);
        let mean = col.mean().unwrap_or(0.0);
        for lag in 0..n {
            let mut acc = 0.0;
            for t in 0..(n - lag) {
                acc += (col[t] - mean) * (col[t + lag] - mean);
            }
            out[[lag, p]] = acc / n as f64;
        }
    }
    out
}

/// FFT autocovariance: zero-padded to the next power of two past `2n - 1` so
/// the circular convolution cannot wrap, then normalised like the brute-force
/// path. rustfft leaves the `1/n_padded` inverse scaling to the caller.
fn autocov_fft(sample: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = sample.dim();
    let mut planner = FftPlanner::new();
    let mut n_padded = 1;
    while n_padded < 2 * n - 1 {
        n_padded <<= 1;
    }
    let fft = planner.plan_fft_forward(n_padded);
    let ffti = planner.plan_fft_inverse(n_padded);

    let cols: Vec<Vec<f64>> = sample
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|col| {
            let mean = col.sum() / col.len() as f64;
            let mut x: Vec<Complex<f64>> = col
                .iter()
                .map(|v| Complex { re: v - mean, im: 0.0 })
                .chain(std::iter::repeat(Complex { re: 0.0, im: 0.0 }).take(n_padded - n))
                .collect();
            fft.process(&mut x);
            for xi in x.iter_mut() {
                *xi = Complex {
                    re: xi.norm_sqr(),
                    im: 0.0,
                };
            }
            ffti.process(&mut x);
            x.iter()
                .take(n)
                .map(|xi| xi.re / n_padded as f64 / n as f64)
                .collect()
        })
        .collect();

    let mut out = Array2::zeros((n, d));
    for (p, col) in cols.iter().enumerate() {
        for (lag, &v) in col.iter().enumerate() {
            out[[lag, p]] = v;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn white_noise(seed: u64, n: usize, d: usize) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |_| rng.sample(StandardNormal))
    }

    #[test]
    fn white_noise_mixes_perfectly() {
        let sample = white_noise(1, 400, 2);
        let diag = split_diagnostics(sample.view());
        for p in 0..2 {
            assert_abs_diff_eq!(diag.rhat[p], 1.0, epsilon = 0.1);
            assert!(diag.ess[p] > 100.0, "ESS {} too small for iid draws", diag.ess[p]);
        }
    }

    #[test]
    fn sticky_chain_has_small_ess() {
        let mut rng = SmallRng::seed_from_u64(2);
        let n = 400;
        let mut x = 0.0;
        let mut sample = Array2::zeros((n, 1));
        for t in 0..n {
            let noise: f64 = rng.sample(StandardNormal);
            x = 0.99 * x + 0.05 * noise;
            sample[[t, 0]] = x;
        }
        let diag = split_diagnostics(sample.view());
        assert!(
            diag.ess[0] < n as f64 / 4.0,
            "ESS {} should reflect the autocorrelation",
            diag.ess[0]
        );
    }

    #[test]
    fn summary_reports_the_five_numbers() {
        let s = summarize("QoI", ndarray::arr1(&[3.0, 1.0, 4.0, 1.0, 5.0]).view());
        assert_eq!((s.min, s.median, s.max), (1.0, 3.0, 5.0));
        assert_abs_diff_eq!(s.mean, 2.8, epsilon = 1e-12);
        assert_abs_diff_eq!(s.std, (3.2_f64).sqrt(), epsilon = 1e-12);
        assert!(format!("{s}").starts_with("QoI in [1.000, 5.000]"));
    }

    #[test]
    fn fft_and_brute_force_autocovariance_agree() {
        let sample = white_noise(3, 256, 2);
        let bf = autocov_bf(sample.view());
        let fft = autocov_fft(sample.view());
        for lag in 0..20 {
            for p in 0..2 {
                assert_abs_diff_eq!(bf[[lag, p]], fft[[lag, p]], epsilon = 1e-8);
            }
        }
    }
}
