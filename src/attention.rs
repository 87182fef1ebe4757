// attention.rs
// ============================================================================
// Note:  Additive attention, score(q, k) = v * tanh(Wq*q + Wk*k). Keys are
//        projected once per batch since they never change across decode
//        steps. Padded positions are forced to -inf before the softmax. The
//        returned weight distribution doubles as the copy distribution over
//        source positions, so it is part of the contract, not a by-product.
// ============================================================================

#![forbid(unsafe_code)]

use bincode::{Decode, Encode};
use ndarray::{Array1, Array2};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Encode, Decode)]
pub struct Attention {
    #[bincode(with_serde)]
    w_key: Array2<f32>, // [key_size, hidden]
    #[bincode(with_serde)]
    w_query: Array2<f32>, // [query_size, hidden]
    #[bincode(with_serde)]
    v_energy: Array1<f32>, // [hidden]
}

impl Attention {
    pub fn new(i_hidden: usize, i_key_size: usize, i_query_size: usize) -> Self {
        Self {
            w_key: init_linear(i_key_size, i_hidden),
            w_query: init_linear(i_query_size, i_hidden),
            v_energy: init_linear(i_hidden, 1).column(0).to_owned(),
        }
    }

    /// Project the keys once per batch; decode steps reuse the result.
    pub fn project_keys(&self, keys: &Array2<f32>) -> Array2<f32> {
        keys.dot(&self.w_key)
    }

    /// One attention read. `mask` marks valid positions with 1.0; masked
    /// energies become -inf so they carry zero weight after normalization.
    /// Returns the context vector and the weight distribution.
    pub fn forward(
        &self,
        query: &Array1<f32>,
        proj_key: &Array2<f32>,
        value: &Array2<f32>,
        mask: Option<&[f32]>,
    ) -> (Array1<f32>, Array1<f32>) {
        let i_positions = proj_key.nrows();
        assert_eq!(value.nrows(), i_positions, "keys and values disagree on length");
        if let Some(m) = mask {
            assert_eq!(m.len(), i_positions, "mask length mismatch");
        }

        let proj_query = query.dot(&self.w_query); // [hidden]
        let mut energies = Array1::<f32>::zeros(i_positions);
        for i_pos in 0..i_positions {
            let masked = mask.is_some_and(|m| m[i_pos] == 0.0);
            if masked {
                energies[i_pos] = f32::NEG_INFINITY;
                continue;
            }
            let mut f_sum = 0.0f32;
            for i_h in 0..self.v_energy.len() {
                f_sum += self.v_energy[i_h] * (proj_query[i_h] + proj_key[(i_pos, i_h)]).tanh();
            }
            energies[i_pos] = f_sum;
        }

        let weights = softmax_1d(&energies);
        let context = weights.dot(value);
        (context, weights)
    }
}

fn init_linear(i_rows: usize, i_cols: usize) -> Array2<f32> {
    let mut rng = rand::rng();
    let f_std = (2.0 / i_rows as f32).sqrt();
    let normal = Normal::new(0.0, f_std).expect("invalid normal distribution");
    Array2::from_shape_fn((i_rows, i_cols), |_| normal.sample(&mut rng))
}

fn softmax_1d(energies: &Array1<f32>) -> Array1<f32> {
    let f_max = energies.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    assert!(f_max > f32::NEG_INFINITY, "attention saw no valid position");
    let mut out = energies.mapv(|x| (x - f_max).exp());
    let f_sum: f32 = out.sum();
    out.mapv_inplace(|x| x / f_sum);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_are_normalized() {
        let attn = Attention::new(4, 6, 3);
        let keys = Array2::from_shape_fn((5, 6), |(i, j)| (i + j) as f32 * 0.1);
        let proj = attn.project_keys(&keys);
        let query = Array1::from_vec(vec![0.3, -0.2, 0.5]);
        let (_ctx, weights) = attn.forward(&query, &proj, &keys, None);
        assert_eq!(weights.len(), 5);
        assert!((weights.sum() - 1.0).abs() < 1e-5);
        assert!(weights.iter().all(|&w| w >= 0.0));
    }

    #[test]
    fn masked_positions_carry_zero_weight() {
        let attn = Attention::new(4, 6, 3);
        let keys = Array2::from_shape_fn((4, 6), |(i, j)| (i * j) as f32 * 0.05);
        let proj = attn.project_keys(&keys);
        let query = Array1::from_vec(vec![0.1, 0.2, 0.3]);
        let mask = [1.0, 1.0, 0.0, 0.0];
        let (_ctx, weights) = attn.forward(&query, &proj, &keys, Some(&mask));
        assert_eq!(weights[2], 0.0);
        assert_eq!(weights[3], 0.0);
        assert!((weights[0] + weights[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn context_is_weighted_sum_of_values() {
        let attn = Attention::new(4, 6, 3);
        let keys = Array2::from_shape_fn((3, 6), |(i, j)| (i as f32 - j as f32) * 0.1);
        let values = Array2::from_shape_fn((3, 2), |(i, j)| (i * 2 + j) as f32);
        let proj = attn.project_keys(&keys);
        let query = Array1::from_vec(vec![0.4, 0.0, -0.3]);
        let (ctx, weights) = attn.forward(&query, &proj, &values, None);
        for i_col in 0..2 {
            let f_manual: f32 = (0..3).map(|i| weights[i] * values[(i, i_col)]).sum();
            assert!((ctx[i_col] - f_manual).abs() < 1e-5);
        }
    }
}
