//! Property-based tests for the quantization codecs and sampling
//!
//! These tests use proptest to verify codec and generation invariants.

use std::sync::Arc;

use hyperion::generate::{generate_text, sample_token, sample_top_p, softmax, GenerationParams};
use hyperion::model::{Activation, LayerKind, Model, ModelArch};
use hyperion::quantize::{
    pack_codes, quantize_asymmetric, quantize_binary, quantize_ternary, select_bit_widths,
    unpack_codes, BitWidth,
};
use hyperion::vocab::FixedVocabulary;
use hyperion::SamplingMethod;
use proptest::prelude::*;

/// Finite buffers below the clipping threshold: mixed-sign, all-positive
/// and all-negative
fn finite_values() -> impl Strategy<Value = Vec<f32>> {
    prop_oneof![
        prop::collection::vec(-100.0f32..100.0, 2..99),
        prop::collection::vec(0.001f32..1000.0, 2..99),
        prop::collection::vec(-1000.0f32..-0.001, 2..99),
        prop::collection::vec(10.0f32..11.0, 2..99),
    ]
}

fn tiny_chain_model(vocab: usize) -> Model {
    let mut model = Model::new(
        ModelArch::Transformer,
        vocab,
        4,
        Arc::new(FixedVocabulary(vocab)),
    )
    .expect("test");
    let mut table = vec![0.0; vocab * vocab];
    let mut proj = vec![0.0; vocab * vocab];
    for t in 0..vocab {
        table[t * vocab + t] = 1.0;
        proj[t * vocab + (t * 3 + 1) % vocab] = 1.0;
    }
    let emb = model
        .add_layer(LayerKind::Embedding, vocab, vocab, Activation::None)
        .expect("test");
    model
        .quantize_layer_weights(emb, &table, BitWidth::Eight, None)
        .expect("test");
    let out = model
        .add_layer(LayerKind::Output, vocab, vocab, Activation::Tanh)
        .expect("test");
    model
        .quantize_layer_weights(out, &proj, BitWidth::Four, None)
        .expect("test");
    model
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// dequantize(quantize(x)) is within one step of x for 4/8/16 bits
    #[test]
    fn test_round_trip_within_one_step(
        values in finite_values(),
        width in prop::sample::select(vec![BitWidth::Four, BitWidth::Eight, BitWidth::Sixteen]),
    ) {
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        prop_assume!(max > min);

        let q = quantize_asymmetric(&values, width).expect("test");
        let magnitude = min.abs().max(max.abs());
        let tolerance = q.scale() * 1.001 + magnitude * 1e-6;
        for (x, y) in values.iter().zip(q.dequantize()) {
            prop_assert!((x - y).abs() <= tolerance, "{} vs {} (scale {})", x, y, q.scale());
        }
    }

    /// 4-bit buffers are exactly ceil(n / 2) bytes and unpack in order
    #[test]
    fn test_four_bit_packing(codes in prop::collection::vec(0u32..16, 1..200)) {
        let packed = pack_codes(&codes, BitWidth::Four);
        prop_assert_eq!(packed.len(), codes.len().div_ceil(2));
        let unpacked = unpack_codes(&packed, codes.len(), BitWidth::Four).expect("test");
        prop_assert_eq!(unpacked, codes);
    }

    /// Packing is lossless at every width
    #[test]
    fn test_packing_all_widths(
        raw in prop::collection::vec(any::<u32>(), 1..64),
        width in prop::sample::select(BitWidth::ALL.to_vec()),
    ) {
        let codes: Vec<u32> = raw.iter().map(|c| c & width.max_code()).collect();
        let packed = pack_codes(&codes, width);
        prop_assert_eq!(packed.len(), width.packed_len(codes.len()));
        prop_assert_eq!(unpack_codes(&packed, codes.len(), width).expect("test"), codes);
    }

    /// Constant input never divides by zero
    #[test]
    fn test_constant_input_is_degenerate(value in -1e6f32..1e6, n in 1usize..300) {
        let q = quantize_asymmetric(&vec![value; n], BitWidth::Four).expect("test");
        prop_assert_eq!(q.scale(), 1.0);
        prop_assert_eq!(q.zero_point(), 0);
        prop_assert!(q.as_bytes().iter().all(|&b| b == 0));
    }

    /// Binary bit is set iff the value is non-negative
    #[test]
    fn test_binary_sign(values in prop::collection::vec(-10.0f32..10.0, 1..128)) {
        let q = quantize_binary(&values).expect("test");
        for (x, code) in values.iter().zip(q.buffer.codes()) {
            prop_assert_eq!(code == 1, *x >= 0.0);
        }
    }

    /// Ternary code is +1 above t, -1 below -t, else 0
    #[test]
    fn test_ternary_threshold(
        values in prop::collection::vec(-5.0f32..5.0, 1..128),
        t in 0.0f32..3.0,
    ) {
        let q = quantize_ternary(&values, t).expect("test");
        for (&x, &c) in values.iter().zip(&q.codes) {
            let expected = if x > t { 1 } else if x < -t { -1 } else { 0 };
            prop_assert_eq!(c, expected);
        }
    }

    /// top_k = 0 always picks the arg-max
    #[test]
    fn test_top_k_zero_is_greedy(draw in 0.0f32..1.0, temperature in 0.1f32..3.0) {
        let idx = sample_token(&[5.0, 2.0, 1.0, -3.0], SamplingMethod::TopK, temperature, 0, 0.9, draw)
            .expect("test");
        prop_assert_eq!(idx, 0);
    }

    /// Nucleus sampling always returns an index inside the vocabulary
    #[test]
    fn test_top_p_in_range(
        logits in prop::collection::vec(-20.0f32..20.0, 1..64),
        p in 0.0f32..1.0,
        draw in 0.0f32..1.0,
    ) {
        let probs = softmax(&logits);
        prop_assert!(sample_top_p(&probs, p, draw) < logits.len());
    }

    /// A tighter memory budget never raises the average bit width
    #[test]
    fn test_mixed_precision_monotone(
        layers in prop::collection::vec(prop::collection::vec(-2.0f32..2.0, 100..160), 1..5),
        a in 0.01f32..1.0,
        b in 0.01f32..1.0,
    ) {
        let (loose, tight) = if a >= b { (a, b) } else { (b, a) };
        let refs: Vec<&[f32]> = layers.iter().map(Vec::as_slice).collect();
        let loose_bits = select_bit_widths(&refs, Some(loose)).expect("test").average_bits();
        let tight_bits = select_bit_widths(&refs, Some(tight)).expect("test").average_bits();
        prop_assert!(tight_bits <= loose_bits);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Generation never writes more than min(max_tokens, capacity) tokens
    #[test]
    fn test_generation_bounds(
        max_tokens in 1usize..24,
        capacity in 1usize..24,
        seed in 1u64..1000,
        method in prop::sample::select(vec![
            SamplingMethod::Greedy,
            SamplingMethod::Temperature,
            SamplingMethod::TopK,
            SamplingMethod::TopP,
        ]),
    ) {
        let mut model = tiny_chain_model(8);
        let params = GenerationParams::default()
            .with_max_tokens(max_tokens)
            .with_seed(seed)
            .with_sampling(method);
        let mut out = vec![u32::MAX; capacity];
        let n = generate_text(&mut model, &params, &mut out).expect("test");
        prop_assert!(n >= 1);
        prop_assert!(n <= max_tokens.min(capacity));
        prop_assert!(out[n..].iter().all(|&t| t == u32::MAX));
        prop_assert!(out[..n].iter().all(|&t| (t as usize) < 8));
    }
}
