//! No-U-Turn sampler over `Array1<f64>` targets, plus sample-pool
//! conditioning (de-duplication and shuffling).

use ndarray::{s, Array1, Array2, ArrayView2};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Exp1, StandardNormal};
use std::cmp::Ordering;

/// Trees whose running joint drops this far below the slice variable are cut
/// off as divergent.
const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// A differentiable unnormalised log-density.
///
/// Implementations write the gradient into `grad` and return the log-density
/// value, so one evaluation serves both the sampler and the score-corrected
/// quadrature kernel.
pub trait HamiltonianTarget {
    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64;
}

/// Single No-U-Turn chain with dual-averaging step-size adaptation
/// (Hoffman & Gelman, JMLR 2014, Algorithm 6).
#[derive(Debug)]
pub struct NutsChain<T: HamiltonianTarget> {
    target: T,
    position: Array1<f64>,
    target_accept_p: f64,
    epsilon: f64,
    m: usize,
    n_discard: usize,
    gamma: f64,
    t_0: usize,
    kappa: f64,
    mu: f64,
    epsilon_bar: f64,
    h_bar: f64,
    rng: SmallRng,
}

impl<T: HamiltonianTarget> NutsChain<T> {
    /// Creates a chain at `initial_position` aiming for the given acceptance
    /// statistic. The step size is found on the first run.
    pub fn new(target: T, initial_position: Array1<f64>, target_accept_p: f64) -> Self {
        let mut thread_rng = rand::rng();
        let rng = SmallRng::from_rng(&mut thread_rng);

        Self {
            target,
            position: initial_position,
            target_accept_p,
            epsilon: -1.0,
            m: 0,
            n_discard: 0,
            gamma: 0.05,
            t_0: 10,
            kappa: 0.75,
            mu: 10.0_f64.ln(),
            epsilon_bar: 1.0,
            h_bar: 0.0,
            rng,
        }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn position(&self) -> &Array1<f64> {
        &self.position
    }

    /// Runs the chain and collects `n_collect` states after dropping
    /// `n_discard` adaptation steps. The returned array is
    /// `n_collect x dim`, first row the starting state of the collected
    /// stretch.
    pub fn run(&mut self, n_collect: usize, n_discard: usize) -> Array2<f64> {
        let dim = self.init_chain_state(n_discard);
        let mut sample = Array2::zeros((n_collect, dim));
        sample.slice_mut(s![0, ..]).assign(&self.position);

        for m in 1..(n_collect + n_discard) {
            self.step();
            if m >= n_discard {
                sample.slice_mut(s![m - n_discard, ..]).assign(&self.position);
            }
        }
        sample
    }

    fn init_chain_state(&mut self, n_discard: usize) -> usize {
        let dim = self.position.len();
        self.n_discard = n_discard;

        let mut mom_0 = Array1::zeros(dim);
        fill_standard_normal(&mut mom_0, &mut self.rng);
        if (self.epsilon + 1.0).abs() <= f64::EPSILON {
            self.epsilon = find_reasonable_epsilon(&self.position, &mom_0, &self.target);
        }
        self.mu = (10.0 * self.epsilon).ln();
        dim
    }

    /// One transition: momentum refresh, slice draw, doubling until the
    /// no-U-turn criterion, then dual-averaging adaptation.
    pub fn step(&mut self) {
        self.m += 1;

        let mut mom_0 = Array1::zeros(self.position.len());
        fill_standard_normal(&mut mom_0, &mut self.rng);

        let mut grad = Array1::zeros(self.position.len());
        let logp = self.target.logp_and_grad(&self.position, &mut grad);
        let joint = logp - 0.5 * mom_0.dot(&mom_0);
        let exp1_obs: f64 = self.rng.sample(Exp1);
        let logu = joint - exp1_obs;

        let mut position_minus = self.position.clone();
        let mut position_plus = self.position.clone();
        let mut mom_minus = mom_0.clone();
        let mut mom_plus = mom_0;
        let mut grad_minus = grad.clone();
        let mut grad_plus = grad;
        let mut j = 0;
        let mut n = 1;
        let mut keep_going = true;
        let mut alpha_sum = 0.0;
        let mut alpha_count = 1;

        while keep_going {
            let u_dir: f64 = self.rng.random();
            let v: i8 = if u_dir < 0.5 { -1 } else { 1 };

            let (position_prime, n_prime, s_prime) = if v == -1 {
                let (
                    position_minus_2,
                    mom_minus_2,
                    grad_minus_2,
                    _,
                    _,
                    _,
                    position_prime_2,
                    _,
                    _,
                    n_prime_2,
                    s_prime_2,
                    alpha_2,
                    alpha_count_2,
                ) = build_tree(
                    position_minus.clone(),
                    mom_minus.clone(),
                    grad_minus.clone(),
                    logu,
                    v,
                    j,
                    self.epsilon,
                    &self.target,
                    joint,
                    &mut self.rng,
                );
                position_minus = position_minus_2;
                mom_minus = mom_minus_2;
                grad_minus = grad_minus_2;
                alpha_sum = alpha_2;
                alpha_count = alpha_count_2;
                (position_prime_2, n_prime_2, s_prime_2)
            } else {
                let (
                    _,
                    _,
                    _,
                    position_plus_2,
                    mom_plus_2,
                    grad_plus_2,
                    position_prime_2,
                    _,
                    _,
                    n_prime_2,
                    s_prime_2,
                    alpha_2,
                    alpha_count_2,
                ) = build_tree(
                    position_plus.clone(),
                    mom_plus.clone(),
                    grad_plus.clone(),
                    logu,
                    v,
                    j,
                    self.epsilon,
                    &self.target,
                    joint,
                    &mut self.rng,
                );
                position_plus = position_plus_2;
                mom_plus = mom_plus_2;
                grad_plus = grad_plus_2;
                alpha_sum = alpha_2;
                alpha_count = alpha_count_2;
                (position_prime_2, n_prime_2, s_prime_2)
            };

            let accept_frac = 1.0_f64.min(n_prime as f64 / n as f64);
            let u_accept: f64 = self.rng.random();
            if s_prime && (u_accept < accept_frac) {
                self.position = position_prime;
            }
            n += n_prime;

            keep_going = s_prime
                && stop_criterion(&position_minus, &position_plus, &mom_minus, &mom_plus);
            j += 1;
        }

        let mut eta = 1.0 / (self.m + self.t_0) as f64;
        self.h_bar = (1.0 - eta) * self.h_bar
            + eta * (self.target_accept_p - alpha_sum / alpha_count as f64);
        if self.m <= self.n_discard {
            let m = self.m as f64;
            self.epsilon = (self.mu - m.sqrt() / self.gamma * self.h_bar).exp();
            eta = m.powf(-self.kappa);
            self.epsilon_bar =
                ((1.0 - eta) * self.epsilon_bar.ln() + eta * self.epsilon.ln()).exp();
        } else {
            self.epsilon = self.epsilon_bar;
        }
    }
}

fn fill_standard_normal(v: &mut Array1<f64>, rng: &mut SmallRng) {
    for x in v.iter_mut() {
        *x = rng.sample(StandardNormal);
    }
}

fn all_finite(v: &Array1<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn find_reasonable_epsilon<T: HamiltonianTarget>(
    position: &Array1<f64>,
    mom: &Array1<f64>,
    target: &T,
) -> f64 {
    let mut epsilon = 1.0;

    let mut grad = Array1::zeros(position.len());
    let ulogp = target.logp_and_grad(position, &mut grad);

    let mut position_prime = position.clone();
    let mut mom_prime = mom.clone();
    let mut grad_prime = grad.clone();
    let mut ulogp_prime = leapfrog(
        &mut position_prime,
        &mut mom_prime,
        &mut grad_prime,
        epsilon,
        target,
    );
    let mut k = 1.0;

    while !ulogp_prime.is_finite() || !all_finite(&grad_prime) {
        k *= 0.5;
        position_prime.assign(position);
        mom_prime.assign(mom);
        grad_prime.assign(&grad);
        ulogp_prime = leapfrog(
            &mut position_prime,
            &mut mom_prime,
            &mut grad_prime,
            epsilon * k,
            target,
        );
    }

    epsilon = 0.5 * k * epsilon;
    let mut log_accept_prob =
        ulogp_prime - ulogp - 0.5 * (mom_prime.dot(&mom_prime) - mom.dot(mom));

    let a: f64 = if log_accept_prob > 0.5_f64.ln() {
        1.0
    } else {
        -1.0
    };

    while a * log_accept_prob > -a * 2.0_f64.ln() {
        epsilon *= 2.0_f64.powf(a);
        position_prime.assign(position);
        mom_prime.assign(mom);
        grad_prime.assign(&grad);
        ulogp_prime = leapfrog(
            &mut position_prime,
            &mut mom_prime,
            &mut grad_prime,
            epsilon,
            target,
        );
        log_accept_prob = ulogp_prime - ulogp - 0.5 * (mom_prime.dot(&mom_prime) - mom.dot(mom));
    }

    epsilon
}

#[allow(clippy::too_many_arguments, clippy::type_complexity)]
fn build_tree<T: HamiltonianTarget>(
    position: Array1<f64>,
    mom: Array1<f64>,
    grad: Array1<f64>,
    logu: f64,
    v: i8,
    j: usize,
    epsilon: f64,
    target: &T,
    joint_0: f64,
    rng: &mut SmallRng,
) -> (
    Array1<f64>,
    Array1<f64>,
    Array1<f64>,
    Array1<f64>,
    Array1<f64>,
    Array1<f64>,
    Array1<f64>,
    Array1<f64>,
    f64,
    usize,
    bool,
    f64,
    usize,
) {
    if j == 0 {
        let mut position_prime = position;
        let mut mom_prime = mom;
        let mut grad_prime = grad;
        let logp_prime = leapfrog(
            &mut position_prime,
            &mut mom_prime,
            &mut grad_prime,
            f64::from(v) * epsilon,
            target,
        );
        let joint = logp_prime - 0.5 * mom_prime.dot(&mom_prime);
        let n_prime = (logu < joint) as usize;
        let s_prime = (logu - DIVERGENCE_THRESHOLD) < joint;
        let alpha_prime = 1.0_f64.min((joint - joint_0).exp());
        (
            position_prime.clone(),
            mom_prime.clone(),
            grad_prime.clone(),
            position_prime.clone(),
            mom_prime,
            grad_prime.clone(),
            position_prime,
            grad_prime,
            logp_prime,
            n_prime,
            s_prime,
            alpha_prime,
            1,
        )
    } else {
        let (
            mut position_minus,
            mut mom_minus,
            mut grad_minus,
            mut position_plus,
            mut mom_plus,
            mut grad_plus,
            mut position_prime,
            mut grad_prime,
            mut logp_prime,
            mut n_prime,
            mut s_prime,
            mut alpha_prime,
            mut alpha_count_prime,
        ) = build_tree(
            position, mom, grad, logu, v, j - 1, epsilon, target, joint_0, rng,
        );
        if s_prime {
            let (
                position_minus_2,
                mom_minus_2,
                grad_minus_2,
                position_plus_2,
                mom_plus_2,
                grad_plus_2,
                position_prime_2,
                grad_prime_2,
                logp_prime_2,
                n_prime_2,
                s_prime_2,
                alpha_prime_2,
                alpha_count_prime_2,
            ) = if v == -1 {
                build_tree(
                    position_minus.clone(),
                    mom_minus.clone(),
                    grad_minus.clone(),
                    logu,
                    v,
                    j - 1,
                    epsilon,
                    target,
                    joint_0,
                    rng,
                )
            } else {
                build_tree(
                    position_plus.clone(),
                    mom_plus.clone(),
                    grad_plus.clone(),
                    logu,
                    v,
                    j - 1,
                    epsilon,
                    target,
                    joint_0,
                    rng,
                )
            };
            if v == -1 {
                position_minus = position_minus_2;
                mom_minus = mom_minus_2;
                grad_minus = grad_minus_2;
            } else {
                position_plus = position_plus_2;
                mom_plus = mom_plus_2;
                grad_plus = grad_plus_2;
            }

            let u_select: f64 = rng.random();
            if u_select < (n_prime_2 as f64 / (n_prime + n_prime_2).max(1) as f64) {
                position_prime = position_prime_2;
                grad_prime = grad_prime_2;
                logp_prime = logp_prime_2;
            }

            n_prime += n_prime_2;
            s_prime = s_prime
                && s_prime_2
                && stop_criterion(&position_minus, &position_plus, &mom_minus, &mom_plus);
            alpha_prime += alpha_prime_2;
            alpha_count_prime += alpha_count_prime_2;
        }
        (
            position_minus,
            mom_minus,
            grad_minus,
            position_plus,
            mom_plus,
            grad_plus,
            position_prime,
            grad_prime,
            logp_prime,
            n_prime,
            s_prime,
            alpha_prime,
            alpha_count_prime,
        )
    }
}

fn stop_criterion(
    position_minus: &Array1<f64>,
    position_plus: &Array1<f64>,
    mom_minus: &Array1<f64>,
    mom_plus: &Array1<f64>,
) -> bool {
    let diff = position_plus - position_minus;
    diff.dot(mom_minus) >= 0.0 && diff.dot(mom_plus) >= 0.0
}

/// One leapfrog integration step, in place. Returns the log-density at the
/// new position and leaves its gradient in `grad`.
fn leapfrog<T: HamiltonianTarget>(
    position: &mut Array1<f64>,
    momentum: &mut Array1<f64>,
    grad: &mut Array1<f64>,
    epsilon: f64,
    target: &T,
) -> f64 {
    momentum.scaled_add(epsilon * 0.5, grad);
    position.scaled_add(epsilon, momentum);
    let logp = target.logp_and_grad(position, grad);
    momentum.scaled_add(epsilon * 0.5, grad);
    logp
}

/// Sorts rows lexicographically and removes exact duplicates.
///
/// Chains can revisit a state bit-for-bit when a whole trajectory is
/// rejected; downstream quadrature assumes distinct support points.
pub fn dedup_rows(sample: ArrayView2<f64>) -> Array2<f64> {
    let dim = sample.ncols();
    let mut rows: Vec<Vec<f64>> = sample.rows().into_iter().map(|r| r.to_vec()).collect();
    rows.sort_by(|a, b| {
        for (x, y) in a.iter().zip(b.iter()) {
            match x.partial_cmp(y) {
                Some(Ordering::Equal) | None => continue,
                Some(ord) => return ord,
            }
        }
        Ordering::Equal
    });
    rows.dedup();

    let n = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n, dim), flat).expect("expected row-major reshape to succeed")
}

/// Returns the rows of `sample` in a fresh random order.
pub fn shuffle_rows<R: Rng>(sample: ArrayView2<f64>, rng: &mut R) -> Array2<f64> {
    let mut order: Vec<usize> = (0..sample.nrows()).collect();
    order.shuffle(rng);
    let mut out = Array2::zeros(sample.dim());
    for (dst, &src) in order.iter().enumerate() {
        out.row_mut(dst).assign(&sample.row(src));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Axis};

    struct StdNormal;

    impl HamiltonianTarget for StdNormal {
        fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
            grad.assign(&position.mapv(|x| -x));
            -0.5 * position.dot(position)
        }
    }

    #[test]
    fn recovers_standard_normal_moments() {
        let initial = Array1::from_elem(2, 0.1);
        let mut chain = NutsChain::new(StdNormal, initial, 0.8).set_seed(42);
        let sample = chain.run(3000, 500);

        let mean = sample.mean_axis(Axis(0)).unwrap();
        let var = sample.var_axis(Axis(0), 0.0);
        for d in 0..2 {
            assert_abs_diff_eq!(mean[d], 0.0, epsilon = 0.15);
            assert_abs_diff_eq!(var[d], 1.0, epsilon = 0.3);
        }
    }

    #[test]
    fn same_seed_reproduces_the_chain() {
        let initial = Array1::from_elem(3, 0.1);
        let a = NutsChain::new(StdNormal, initial.clone(), 0.8)
            .set_seed(7)
            .run(200, 50);
        let b = NutsChain::new(StdNormal, initial, 0.8)
            .set_seed(7)
            .run(200, 50);
        assert_eq!(a, b);
    }

    #[test]
    fn dedup_sorts_and_removes_exact_repeats() {
        let sample = arr2(&[
            [1.0, 2.0],
            [0.5, -1.0],
            [1.0, 2.0],
            [0.5, -1.0],
            [0.5, 3.0],
        ]);
        let unique = dedup_rows(sample.view());
        assert_eq!(unique, arr2(&[[0.5, -1.0], [0.5, 3.0], [1.0, 2.0]]));
    }

    #[test]
    fn shuffle_preserves_the_multiset_of_rows() {
        let sample = arr2(&[[1.0, 0.0], [2.0, 0.0], [3.0, 0.0], [4.0, 0.0]]);
        let mut rng = SmallRng::seed_from_u64(9);
        let shuffled = shuffle_rows(sample.view(), &mut rng);
        let mut original: Vec<f64> = sample.column(0).to_vec();
        let mut moved: Vec<f64> = shuffled.column(0).to_vec();
        original.sort_by(|a, b| a.partial_cmp(b).unwrap());
        moved.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(original, moved);
    }
}
