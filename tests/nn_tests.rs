//! Probabilistic, regularization, sequence and spatial operators.

use gradmesh::graph::nn::Conv2D;
use gradmesh::types::NodeId;
use gradmesh::{Graph, Tensor};

fn check_gradient(g: &mut Graph, f: NodeId, x: NodeId) {
    let (rows, cols) = g.forward(f).unwrap().shape();
    let seed = Tensor::ones(rows, cols);
    g.backward(f, &seed).unwrap();
    let analytic = g.gradient(x).expect("input reached by backward").clone();
    let numeric = g.dfdx(f, x).unwrap();
    for (idx, (a, n)) in analytic
        .as_slice()
        .iter()
        .zip(numeric.as_slice())
        .enumerate()
    {
        let tolerance = (0.01 * a.abs()).max(1e-3);
        assert!(
            (a - n).abs() <= tolerance,
            "element {idx}: analytic {a} vs numeric {n}"
        );
    }
}

#[test]
fn softmax_rows_are_distributions() {
    let mut g = Graph::with_seed(21);
    let values = Tensor::random(5, 7, g.rng());
    let x = g.constant_from(values);
    let y = g.softmax(x);
    let out = g.forward(y).unwrap();
    for i in 0..5 {
        let mut sum = 0.0;
        for j in 0..7 {
            let v = out.get(i, j);
            assert!((0.0..=1.0).contains(&v), "softmax output out of range: {v}");
            sum += v;
        }
        assert!((sum - 1.0).abs() <= 1e-6, "row {i} sums to {sum}");
    }
}

#[test]
fn softmax_survives_large_logits() {
    let mut g = Graph::new();
    let x = g.constant_from(Tensor::from_vec(1, 3, vec![1000.0, 1001.0, 999.0]).unwrap());
    let y = g.softmax(x);
    let out = g.forward(y).unwrap();
    let sum: f32 = out.as_slice().iter().sum();
    assert!(out.as_slice().iter().all(|v| v.is_finite()));
    assert!((sum - 1.0).abs() <= 1e-6);
}

#[test]
fn softmax_gradient() {
    let mut g = Graph::with_seed(22);
    let x = g.constant_from(Tensor::from_vec(2, 4, vec![0.3, -0.8, 1.2, 0.1, -0.4, 0.9, -1.1, 0.5]).unwrap());
    let y = g.softmax(x);
    // Weight the outputs so row gradients are not identically zero
    // (softmax rows sum to one, so a uniform seed cancels).
    let w = g.constant_from(Tensor::from_vec(2, 4, vec![1.0, 2.0, 3.0, 4.0, 4.0, 3.0, 2.0, 1.0]).unwrap());
    let weighted = g.mul(y, w);
    check_gradient(&mut g, weighted, x);
}

#[test]
fn log_softmax_matches_log_of_softmax() {
    let mut g = Graph::with_seed(23);
    let values = Tensor::random(4, 6, g.rng());
    let x = g.constant_from(values);
    let ls = g.log_softmax(x);
    let sm = g.softmax(x);
    let log_sm = g.log(sm);
    let a = g.forward(ls).unwrap().clone();
    let b = g.forward(log_sm).unwrap().clone();
    assert!(a.is_approx(&b, 1e-5));

    // exp(log_softmax) is a distribution per row.
    let e = g.exp(ls);
    let rows = g.forward(e).unwrap();
    for i in 0..4 {
        let mut sum = 0.0;
        for j in 0..6 {
            sum += rows.get(i, j);
        }
        assert!((sum - 1.0).abs() <= 1e-6);
    }
}

#[test]
fn log_softmax_gradient() {
    let mut g = Graph::with_seed(24);
    let x = g.constant_from(Tensor::from_vec(2, 3, vec![0.2, -0.9, 0.7, 1.1, 0.0, -0.5]).unwrap());
    let y = g.log_softmax(x);
    let w = g.constant_from(Tensor::from_vec(2, 3, vec![1.0, -1.0, 2.0, 0.5, 2.0, -0.5]).unwrap());
    let weighted = g.mul(y, w);
    check_gradient(&mut g, weighted, x);
}

#[test]
fn gaussian_gradients() {
    let mut g = Graph::with_seed(25);
    let x = g.constant_from(Tensor::from_vec(1, 3, vec![0.2, -0.4, 1.0]).unwrap());
    let mu = g.constant_from(Tensor::from_vec(1, 3, vec![0.0, 0.3, 0.8]).unwrap());
    let sigma = g.constant_from(Tensor::from_vec(1, 3, vec![0.9, 1.2, 0.7]).unwrap());
    let y = g.gaussian(x, mu, sigma);
    check_gradient(&mut g, y, x);
    check_gradient(&mut g, y, mu);
    check_gradient(&mut g, y, sigma);
}

#[test]
fn log_gaussian_gradients_and_consistency() {
    let mut g = Graph::with_seed(26);
    let x = g.constant_from(Tensor::from_vec(1, 3, vec![-0.3, 0.5, 1.2]).unwrap());
    let mu = g.constant_from(Tensor::from_vec(1, 3, vec![0.1, 0.1, 0.1]).unwrap());
    let sigma = g.constant_from(Tensor::from_vec(1, 3, vec![1.1, 0.8, 1.4]).unwrap());
    let lg = g.log_gaussian(x, mu, sigma);
    let pdf = g.gaussian(x, mu, sigma);
    let log_pdf = g.log(pdf);
    let a = g.forward(lg).unwrap().clone();
    let b = g.forward(log_pdf).unwrap().clone();
    assert!(a.is_approx(&b, 1e-5));
    check_gradient(&mut g, lg, x);
    check_gradient(&mut g, lg, sigma);
}

#[test]
fn sampler_reparameterizes() {
    let mut g = Graph::with_seed(27);
    let mu = g.constant_from(Tensor::zeros(50, 100));
    let sigma = g.constant_from(Tensor::ones(50, 100));
    let y = g.sampler(mu, sigma);
    let out = g.forward(y).unwrap().clone();

    let n = out.len() as f32;
    let mean = out.as_slice().iter().sum::<f32>() / n;
    let var = out.as_slice().iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    assert!(mean.abs() < 0.05, "sample mean {mean}");
    assert!((var - 1.0).abs() < 0.1, "sample variance {var}");

    g.backward(y, &Tensor::ones(50, 100)).unwrap();
    // d/dmu = 1, d/dsigma = eps, and with mu=0, sigma=1 the output is eps.
    assert!(g.gradient(mu).unwrap().is_approx(&Tensor::ones(50, 100), 1e-6));
    assert!(g.gradient(sigma).unwrap().is_approx(&out, 1e-6));
}

#[test]
fn dropout_mask_law() {
    let mut g = Graph::with_seed(42);
    let x = g.constant_from(Tensor::ones(100, 500));
    let y = g.dropout(x, 0.5);

    let first = g.forward(y).unwrap().clone();
    let mean_a = first.as_slice().iter().sum::<f32>() / first.len() as f32;

    // Backward gradient is exactly the cached mask; with a ones input the
    // forward value is the mask itself.
    g.backward(y, &Tensor::ones(100, 500)).unwrap();
    assert!(g.gradient(x).unwrap().is_approx(&first, 0.0));
    for &v in first.as_slice() {
        assert!(v == 0.0 || (v - 2.0).abs() <= 1e-6);
    }

    g.recache();
    let second = g.forward(y).unwrap();
    let mean_b = second.as_slice().iter().sum::<f32>() / second.len() as f32;
    let mean = 0.5 * (mean_a + mean_b);
    assert!((mean - 1.0).abs() < 0.01, "mask mean {mean}");
}

#[test]
fn dropout_zero_rate_is_identity() {
    let mut g = Graph::with_seed(43);
    let values = Tensor::random(3, 3, g.rng());
    let x = g.constant_from(values.clone());
    let y = g.dropout(x, 0.0);
    assert!(g.forward(y).unwrap().is_approx(&values, 0.0));
    g.backward(y, &Tensor::ones(3, 3)).unwrap();
    assert!(g.gradient(x).unwrap().is_approx(&Tensor::ones(3, 3), 0.0));
}

#[test]
fn embedding_stacks_rows_and_accumulates_duplicates() {
    let mut g = Graph::new();
    let indices = g.constant_from(Tensor::from_vec(1, 3, vec![2.0, 0.0, 2.0]).unwrap());
    let table = g.constant_from(
        Tensor::from_vec(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
    );
    let y = g.embedding(indices, table);
    let expected = Tensor::from_vec(3, 2, vec![5.0, 6.0, 1.0, 2.0, 5.0, 6.0]).unwrap();
    assert!(g.forward(y).unwrap().is_approx(&expected, 0.0));

    g.backward(y, &Tensor::ones(3, 2)).unwrap();
    let grad = g.gradient(table).unwrap();
    let expected_grad =
        Tensor::from_vec(3, 2, vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]).unwrap();
    assert!(grad.is_approx(&expected_grad, 0.0));
}

#[test]
fn layer_norm_normalizes_rows() {
    let mut g = Graph::new();
    let x = g.constant_from(Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap());
    let a = g.constant_from(Tensor::ones(1, 4));
    let b = g.constant_from(Tensor::zeros(1, 4));
    let y = g.layer_norm(x, a, b);
    let expected =
        Tensor::from_vec(1, 4, vec![-1.341641, -0.447214, 0.447214, 1.341641]).unwrap();
    assert!(g.forward(y).unwrap().is_approx(&expected, 1e-3));
}

#[test]
fn layer_norm_gradients() {
    let mut g = Graph::with_seed(28);
    let x = g.constant_from(Tensor::from_vec(2, 4, vec![0.6, -1.2, 0.9, 0.3, 1.5, 0.2, -0.7, -0.4]).unwrap());
    let a = g.constant_from(Tensor::from_vec(1, 4, vec![1.2, 0.8, -0.5, 1.0]).unwrap());
    let b = g.constant_from(Tensor::from_vec(1, 4, vec![0.1, -0.2, 0.3, 0.0]).unwrap());
    let y = g.layer_norm(x, a, b);
    let w = g.constant_from(Tensor::from_vec(2, 4, vec![1.0, 2.0, -1.0, 0.5, -0.5, 1.5, 1.0, 2.0]).unwrap());
    let weighted = g.mul(y, w);
    check_gradient(&mut g, weighted, x);
    check_gradient(&mut g, weighted, a);
    check_gradient(&mut g, weighted, b);
}

#[test]
fn conv2d_dilated_padded_fixture() {
    // 1x2x3 input, 2x2 kernel, stride 1, pad 1, dilation 2.
    let mut g = Graph::new();
    let x = g.constant_from(Tensor::from_vec(1, 6, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap());
    let k = g.constant_from(Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap());
    let conv = Conv2D::new(2, 3, 1, 1, 2, 2, 1, 1, 2);
    let y = g.conv2d(x, k, conv);
    let out = g.forward(y).unwrap();
    let expected = Tensor::from_vec(1, 6, vec![20.0, 36.0, 15.0, 4.0, 7.0, 2.0]).unwrap();
    assert!(out.is_approx(&expected, 1e-5), "got {:?}", out.as_slice());
}

#[test]
fn conv2d_gradients_match_central_differences() {
    let mut g = Graph::with_seed(29);
    let x_values = Tensor::random(1, 2 * 4 * 4, g.rng());
    let k_values = Tensor::random(3 * 2, 2 * 2, g.rng());
    let x = g.constant_from(x_values);
    let k = g.constant_from(k_values);
    // 2 input channels on a 4x4 image, 3 output channels, 2x2 kernel.
    let conv = Conv2D::new(4, 4, 2, 3, 2, 2, 1, 1, 1);
    let y = g.conv2d(x, k, conv);
    check_gradient(&mut g, y, x);
    check_gradient(&mut g, y, k);
}

#[test]
fn gru_gate_conventions() {
    let mut g = Graph::with_seed(30);
    let x = g.constant_from(Tensor::from_vec(1, 4, vec![0.0, 20.0, -20.0, 0.0]).unwrap());
    let h = g.constant_from(Tensor::from_vec(1, 4, vec![0.4, -0.8, 0.6, 1.0]).unwrap());
    let cell = g.gru(x, h, 4, 4);

    // Zero gates (z = r = 1/2), candidate reduced to tanh(x).
    for id in [cell.wz, cell.uz, cell.bz, cell.wr, cell.ur, cell.br, cell.uh, cell.bh] {
        let shape = g.value(id).unwrap().shape();
        g.set_value(id, Tensor::zeros(shape.0, shape.1)).unwrap();
    }
    g.set_value(cell.wh, Tensor::identity(4)).unwrap();

    // h' = z (*) h + (1 - z) (*) tanh(x) = 0.5 h + 0.5 [0, 1, -1, 0]
    let out = g.forward(cell.output).unwrap();
    let expected = Tensor::from_vec(1, 4, vec![0.2, 0.1, -0.2, 0.5]).unwrap();
    assert!(out.is_approx(&expected, 1e-3), "got {:?}", out.as_slice());
}

#[test]
fn gru_gradients() {
    let mut g = Graph::with_seed(31);
    let x = g.constant_from(Tensor::from_vec(1, 3, vec![0.3, -0.6, 0.9]).unwrap());
    let h = g.constant_from(Tensor::from_vec(1, 3, vec![-0.2, 0.5, 0.1]).unwrap());
    let cell = g.gru(x, h, 3, 3);
    check_gradient(&mut g, cell.output, x);
    check_gradient(&mut g, cell.output, h);
    check_gradient(&mut g, cell.output, cell.wz);
    check_gradient(&mut g, cell.output, cell.uh);
    check_gradient(&mut g, cell.output, cell.bh);
}

#[test]
fn masked_attention_ignores_forbidden_positions() {
    let mut g = Graph::new();
    let q = g.constant_from(Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap());
    let k = g.constant_from(Tensor::from_vec(2, 2, vec![0.4, 0.6, -0.3, 0.8]).unwrap());
    let v = g.constant_from(Tensor::from_vec(2, 2, vec![10.0, 20.0, 30.0, 40.0]).unwrap());
    let mask = g.constant_from(Tensor::from_vec(2, 2, vec![1.0, 0.0, 1.0, 1.0]).unwrap());
    let y = g.attention(q, k, v, Some(mask), 2, 2, 2, 0.0);
    let out = g.forward(y).unwrap();
    // Row 0 may only attend to position 0.
    assert!((out.get(0, 0) - 10.0).abs() < 1e-4);
    assert!((out.get(0, 1) - 20.0).abs() < 1e-4);
    assert_eq!(out.shape(), (2, 2));
}

#[test]
fn attention_gradients() {
    let mut g = Graph::with_seed(32);
    let q_values = Tensor::random(2, 3, g.rng());
    let k_values = Tensor::random(4, 3, g.rng());
    let v_values = Tensor::random(4, 3, g.rng());
    let q = g.constant_from(q_values);
    let k = g.constant_from(k_values);
    let v = g.constant_from(v_values);
    let y = g.attention(q, k, v, None, 2, 4, 3, 0.0);
    assert_eq!(g.forward(y).unwrap().shape(), (2, 3));
    check_gradient(&mut g, y, q);
    check_gradient(&mut g, y, k);
    check_gradient(&mut g, y, v);
}

#[test]
fn multi_head_attention_shapes_and_gradients() {
    let mut g = Graph::with_seed(33);
    let x_values = Tensor::random(3, 4, g.rng());
    let x = g.constant_from(x_values);
    let mha = g
        .multi_head_attention(x, x, x, None, 3, 3, 4, 2, true, 0.0)
        .unwrap();
    assert_eq!(g.forward(mha.output).unwrap().shape(), (3, 4));
    check_gradient(&mut g, mha.output, x);
    check_gradient(&mut g, mha.output, mha.wq);
    check_gradient(&mut g, mha.output, mha.wo);
}

#[test]
fn multi_head_attention_requires_divisible_heads() {
    let mut g = Graph::new();
    let x = g.constant_from(Tensor::zeros(2, 5));
    assert!(g
        .multi_head_attention(x, x, x, None, 2, 2, 5, 2, false, 0.0)
        .is_err());
}

#[test]
fn rowwise_applies_a_builder_per_row() {
    let mut g = Graph::new();
    let x = g.constant_from(Tensor::from_vec(3, 2, vec![1.0, -2.0, -3.0, 4.0, 5.0, -6.0]).unwrap());
    let y = g.rowwise(x, 3, 2, 2, |g, row| g.relu(row));
    let expected = Tensor::from_vec(3, 2, vec![1.0, 0.0, 0.0, 4.0, 5.0, 0.0]).unwrap();
    assert!(g.forward(y).unwrap().is_approx(&expected, 0.0));

    g.backward(y, &Tensor::ones(3, 2)).unwrap();
    let expected_grad = Tensor::from_vec(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0]).unwrap();
    assert!(g.gradient(x).unwrap().is_approx(&expected_grad, 0.0));
}
