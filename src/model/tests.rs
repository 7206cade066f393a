use std::sync::Arc;

use super::*;
use crate::format::{
    encode_package, write_package, Domain, PackageHeader, PackageMetadata, QuantizationKind,
};
use crate::vocab::{FixedVocabulary, TokenId, TOKEN_UNKNOWN};

fn identity(n: usize) -> Vec<f32> {
    let mut w = vec![0.0; n * n];
    for i in 0..n {
        w[i * n + i] = 1.0;
    }
    w
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn vocab(n: usize) -> Arc<dyn Vocabulary> {
    Arc::new(FixedVocabulary(n))
}

/// Embedding (identity) followed by an identity output projection
fn tiny_model(arch: ModelArch) -> Model {
    let mut model = Model::new(arch, 4, 3, vocab(4)).expect("test");
    let emb = model
        .add_layer(LayerKind::Embedding, 4, 4, Activation::None)
        .expect("test");
    model
        .quantize_layer_weights(emb, &identity(4), BitWidth::Eight, None)
        .expect("test");
    let out = model
        .add_layer(LayerKind::Output, 4, 4, Activation::None)
        .expect("test");
    model
        .quantize_layer_weights(out, &identity(4), BitWidth::Eight, Some(vec![0.0; 4]))
        .expect("test");
    model
}

// ============================================================================
// Layer types
// ============================================================================

#[test]
fn test_activation_values() {
    assert_eq!(Activation::None.apply(-2.0), -2.0);
    assert_eq!(Activation::ReLU.apply(-2.0), 0.0);
    assert_eq!(Activation::ReLU.apply(3.0), 3.0);
    assert!((Activation::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
    assert!((Activation::Tanh.apply(1.0) - 0.761_594_2).abs() < 1e-5);
    assert_eq!(Activation::Gelu.apply(0.0), 0.0);
    assert!((Activation::Gelu.apply(1.0) - 0.841_192).abs() < 1e-3);
}

#[test]
fn test_layer_tags() {
    for kind in [
        LayerKind::Embedding,
        LayerKind::Dense,
        LayerKind::Attention,
        LayerKind::LayerNorm,
        LayerKind::Output,
    ] {
        assert_eq!(LayerKind::from_tag(kind.tag()).expect("test"), kind);
    }
    assert!(LayerKind::from_tag(2).is_err());
    assert!(LayerKind::from_tag(6).is_err());
    assert!(Activation::from_tag(5).is_err());
    assert_eq!(ModelArch::from_tag(1).expect("test"), ModelArch::Transformer);
    assert!(ModelArch::from_tag(2).is_err());
}

#[test]
fn test_layer_rejects_bad_shapes() {
    assert!(LayerDescriptor::new(LayerKind::Dense, 0, 4, Activation::None).is_err());

    let mut layer = LayerDescriptor::new(LayerKind::Dense, 2, 3, Activation::None).expect("test");
    let short = quantize_asymmetric(&[1.0; 5], BitWidth::Four).expect("test");
    assert!(matches!(
        layer.set_weights(short, None),
        Err(HyperionError::DataShapeMismatch { data_size: 5, expected: 6, .. })
    ));

    let weights = quantize_asymmetric(&[1.0; 6], BitWidth::Four).expect("test");
    assert!(layer.set_weights(weights.clone(), Some(vec![0.0; 2])).is_err());
    assert!(layer.weights().is_none());
    layer.set_weights(weights, Some(vec![0.0; 3])).expect("test");
    assert_eq!(layer.parameter_count(), 9);
}

// ============================================================================
// Model
// ============================================================================

#[test]
fn test_model_rejects_zero_sizes() {
    assert!(Model::new(ModelArch::Transformer, 0, 4, vocab(4)).is_err());
    assert!(Model::new(ModelArch::Transformer, 4, 0, vocab(4)).is_err());
}

#[test]
fn test_add_layer_grows_activation_buffers() {
    let mut model = Model::new(ModelArch::Transformer, 2, 3, vocab(4)).expect("test");
    assert_eq!(model.activation_capacity(), 6);
    let idx = model
        .add_layer(LayerKind::Dense, 2, 8, Activation::ReLU)
        .expect("test");
    assert_eq!(idx, 0);
    assert_eq!(model.layer_count(), 1);
    assert_eq!(model.activation_capacity(), 24);
}

#[test]
fn test_oversized_activation_buffers_are_refused() {
    let huge = 1usize << 22;
    assert!(matches!(
        Model::new(ModelArch::Transformer, huge, huge, vocab(4)),
        Err(HyperionError::OutOfMemory { .. })
    ));

    let mut model = Model::new(ModelArch::Transformer, 2, 3, vocab(4)).expect("test");
    assert!(matches!(
        model.add_layer(LayerKind::Dense, 2, MAX_ACTIVATION_ELEMENTS, Activation::None),
        Err(HyperionError::OutOfMemory { .. })
    ));
    assert_eq!(model.layer_count(), 0);
    assert_eq!(model.activation_capacity(), 6);
}

#[test]
fn test_set_layer_weights_out_of_range() {
    let mut model = tiny_model(ModelArch::Transformer);
    let weights = quantize_asymmetric(&identity(4), BitWidth::Four).expect("test");
    assert!(model.set_layer_weights(7, weights, None).is_err());
}

#[test]
fn test_fork_shares_weights() {
    let model = tiny_model(ModelArch::Transformer);
    let mut fork = model.fork();
    assert!(Arc::ptr_eq(&model.layers[0], &fork.layers[0]));
    assert!(!std::ptr::eq(
        model.activations[0].as_ptr(),
        fork.activations[0].as_ptr()
    ));

    // Writing through the fork copies the shared descriptor first
    let zeros = quantize_asymmetric(&[0.0; 16], BitWidth::Four).expect("test");
    fork.set_layer_weights(0, zeros, None).expect("test");
    assert!(!Arc::ptr_eq(&model.layers[0], &fork.layers[0]));
    assert_eq!(
        model.layer(0).and_then(LayerDescriptor::weights).map(QuantizedBuffer::bit_width),
        Some(BitWidth::Eight)
    );
}

#[test]
fn test_requantize_replaces_every_buffer() {
    let mut model = tiny_model(ModelArch::Transformer);
    model.requantize(BitWidth::Four).expect("test");
    for layer in model.layers() {
        let w = layer.weights().expect("test");
        assert_eq!(w.bit_width(), BitWidth::Four);
        assert_eq!(w.memory_bytes(), 8);
    }
    assert_eq!(argmax(&model.forward(&[3]).expect("test")), 3);

    model
        .requantize_mixed(&[BitWidth::Eight, BitWidth::Two])
        .expect("test");
    let widths: Vec<_> = model
        .layers()
        .filter_map(|l| l.weights().map(QuantizedBuffer::bit_width))
        .collect();
    assert_eq!(widths, vec![BitWidth::Eight, BitWidth::Two]);
    assert!(model.requantize_mixed(&[BitWidth::Four]).is_err());
}

#[test]
fn test_requantize_is_all_or_nothing() {
    let mut model = tiny_model(ModelArch::Transformer);
    model
        .add_layer(LayerKind::Attention, 4, 4, Activation::None)
        .expect("test");
    assert!(model.requantize(BitWidth::Four).is_err());
    let first = model.layer(0).and_then(LayerDescriptor::weights).expect("test");
    assert_eq!(first.bit_width(), BitWidth::Eight);
}

#[test]
fn test_destroy_model_releases_vocabulary_handle() {
    let shared = vocab(4);
    let model = Model::new(ModelArch::Transformer, 4, 2, Arc::clone(&shared)).expect("test");
    assert_eq!(Arc::strong_count(&shared), 2);
    destroy_model(model);
    assert_eq!(Arc::strong_count(&shared), 1);
    assert_eq!(shared.token_count(), 4);
}

// ============================================================================
// Forward pass
// ============================================================================

#[test]
fn test_forward_selects_embedded_token() {
    let mut model = tiny_model(ModelArch::Transformer);
    for token in 0..4 {
        let logits = model.forward(&[token]).expect("test");
        assert_eq!(logits.len(), 4);
        assert_eq!(argmax(&logits), token as usize);
        assert!((logits[token as usize] - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_forward_maps_out_of_range_token_to_unknown() {
    let mut model = tiny_model(ModelArch::RecurrentSequential);
    let logits = model.forward(&[99]).expect("test");
    assert_eq!(argmax(&logits), TOKEN_UNKNOWN as usize);
}

#[test]
fn test_forward_truncates_to_context() {
    let mut model = tiny_model(ModelArch::Transformer);
    let long: Vec<TokenId> = vec![3, 3, 3, 3, 3, 3, 0, 1, 2];
    let tail = model.forward(&long[long.len() - 3..]).expect("test");
    let full = model.forward(&long).expect("test");
    assert_eq!(full, tail);
    assert_eq!(argmax(&full), 2);

    let other = model.forward(&[0, 0, 0, 0, 0, 0, 0, 1, 2]).expect("test");
    assert_eq!(other, full);
}

#[test]
fn test_forward_dense_adds_bias() {
    let mut model = tiny_model(ModelArch::Transformer);
    let dense = model
        .add_layer(LayerKind::Dense, 4, 4, Activation::ReLU)
        .expect("test");
    model
        .quantize_layer_weights(dense, &[0.0; 16], BitWidth::Four, Some(vec![-1.0, 0.0, 5.0, 0.0]))
        .expect("test");
    let logits = model.forward(&[1]).expect("test");
    assert_eq!(logits, vec![0.0, 0.0, 5.0, 0.0]);
}

#[test]
fn test_forward_layer_norm_normalizes_each_position() {
    let mut model = Model::new(ModelArch::Transformer, 4, 2, vocab(4)).expect("test");
    let emb = model
        .add_layer(LayerKind::Embedding, 4, 4, Activation::None)
        .expect("test");
    let table: Vec<f32> = (0..16).map(|i| (i % 4) as f32).collect();
    model
        .quantize_layer_weights(emb, &table, BitWidth::Eight, None)
        .expect("test");
    model
        .add_layer(LayerKind::Attention, 4, 4, Activation::None)
        .expect("test");
    model
        .add_layer(LayerKind::LayerNorm, 4, 4, Activation::None)
        .expect("test");

    let out = model.forward(&[0, 1]).expect("test");
    let mean = out.iter().sum::<f32>() / 4.0;
    let var = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
    assert!(mean.abs() < 1e-4);
    assert!((var - 1.0).abs() < 1e-3);
    assert!(out[0] < out[1] && out[1] < out[2] && out[2] < out[3]);
}

#[test]
fn test_forward_recurrent_rejects_layer_norm() {
    let mut model = tiny_model(ModelArch::RecurrentSequential);
    model
        .add_layer(LayerKind::LayerNorm, 4, 4, Activation::None)
        .expect("test");
    assert!(matches!(
        model.forward(&[1]),
        Err(HyperionError::UnsupportedOperation { .. })
    ));
}

#[test]
fn test_forward_errors() {
    let mut model = tiny_model(ModelArch::Transformer);
    assert!(model.forward(&[]).is_err());

    // Width mismatch
    model
        .add_layer(LayerKind::Dense, 3, 4, Activation::None)
        .expect("test");
    assert!(matches!(model.forward(&[1]), Err(HyperionError::InvalidShape { .. })));

    // Missing weights
    let mut model = tiny_model(ModelArch::Transformer);
    model
        .add_layer(LayerKind::Dense, 4, 4, Activation::None)
        .expect("test");
    assert!(model.forward(&[1]).is_err());

    // Logits narrower than the vocabulary
    let mut model = Model::new(ModelArch::Transformer, 4, 2, vocab(8)).expect("test");
    let emb = model
        .add_layer(LayerKind::Embedding, 8, 4, Activation::None)
        .expect("test");
    model
        .quantize_layer_weights(emb, &[0.5; 32], BitWidth::Four, None)
        .expect("test");
    assert!(model.forward(&[1]).is_err());

    let mut empty = Model::new(ModelArch::Transformer, 4, 2, vocab(4)).expect("test");
    assert!(empty.forward(&[1]).is_err());
}

// ============================================================================
// Loader
// ============================================================================

#[test]
fn test_package_round_trip() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join("tiny.hmod");
    let model = tiny_model(ModelArch::Transformer);
    let meta = PackageMetadata {
        model_name: "tiny".to_string(),
        ..PackageMetadata::default()
    };
    save_package(&model, &path, &meta).expect("test");

    let package = crate::format::read_package(&path).expect("test");
    assert_eq!(package.header.quantization, QuantizationKind::Int8);
    assert_eq!(package.header.parameter_count, 40);
    assert_eq!(package.metadata.layer_count, 2);
    assert_eq!(package.metadata.vocab_size, 4);

    let loaded = load_package(&path, None).expect("test");
    assert_eq!(loaded.layer_count(), 2);
    assert_eq!(loaded.vocabulary().token_count(), 4);
    for (a, b) in model.layers().zip(loaded.layers()) {
        assert_eq!(a.weights(), b.weights());
        assert_eq!(a.kind(), b.kind());
    }
    let missing_bias = loaded.layer(0).and_then(LayerDescriptor::bias).expect("test");
    assert_eq!(missing_bias, &[0.0; 4]);
}

#[test]
fn test_mixed_width_package_infers_widths() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join("mixed.hmod");
    let mut model = tiny_model(ModelArch::Transformer);
    model
        .requantize_mixed(&[BitWidth::Eight, BitWidth::Three])
        .expect("test");
    save_package(&model, &path, &PackageMetadata::default()).expect("test");

    let mut loaded = load_model(&path, None, None).expect("test");
    let widths: Vec<_> = loaded
        .layers()
        .filter_map(|l| l.weights().map(QuantizedBuffer::bit_width))
        .collect();
    assert_eq!(widths, vec![BitWidth::Eight, BitWidth::Three]);
    assert_eq!(argmax(&loaded.forward(&[2]).expect("test")), 2);
}

#[test]
fn test_ambiguous_mixed_widths_cannot_be_saved() {
    let mut model = Model::new(ModelArch::Transformer, 1, 1, vocab(1)).expect("test");
    model
        .add_layer(LayerKind::Embedding, 1, 1, Activation::None)
        .expect("test");
    model
        .add_layer(LayerKind::Output, 1, 1, Activation::None)
        .expect("test");
    model
        .requantize_mixed(&[BitWidth::Two, BitWidth::Four])
        .expect_err("layers without weights");
    model
        .quantize_layer_weights(0, &[0.5], BitWidth::Two, None)
        .expect("test");
    model
        .quantize_layer_weights(1, &[0.5], BitWidth::Four, None)
        .expect("test");
    assert!(encode_weights_section(&model).is_err());
}

#[test]
fn test_decode_rejects_malformed_sections() {
    let model = tiny_model(ModelArch::Transformer);
    let (kind, section) = encode_weights_section(&model).expect("test");

    // Zero layers
    let mut zero = section.clone();
    zero[4..8].copy_from_slice(&0u32.to_le_bytes());
    assert!(decode_weights_section(&zero, kind, vocab(4)).is_err());

    // Zero weight bytes on the first layer
    let mut no_weights = section.clone();
    no_weights[16 + 24..16 + 28].copy_from_slice(&0u32.to_le_bytes());
    assert!(decode_weights_section(&no_weights, kind, vocab(4)).is_err());

    // Bias length disagrees with output size
    let mut bad_bias = section.clone();
    bad_bias[16 + 28..16 + 32].copy_from_slice(&12u32.to_le_bytes());
    assert!(decode_weights_section(&bad_bias, kind, vocab(4)).is_err());

    // Truncated and trailing data
    assert!(decode_weights_section(&section[..section.len() - 1], kind, vocab(4)).is_err());
    let mut trailing = section.clone();
    trailing.push(0);
    assert!(decode_weights_section(&trailing, kind, vocab(4)).is_err());

    // Declared width does not match the packed length
    assert!(decode_weights_section(&section, QuantizationKind::Int4, vocab(4)).is_err());
    assert!(decode_weights_section(&section, QuantizationKind::Fp32, vocab(4)).is_err());

    assert!(decode_weights_section(&section, kind, vocab(4)).is_ok());
}

#[test]
fn test_load_package_rejects_non_text_domain() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join("audio.hmod");
    let (kind, section) = encode_weights_section(&tiny_model(ModelArch::Transformer)).expect("test");
    let header = PackageHeader::new(Domain::Audio, kind);
    write_package(&path, &header, &PackageMetadata::default(), &section).expect("test");
    assert!(matches!(
        load_package(&path, Some(vocab(4))),
        Err(HyperionError::UnsupportedOperation { .. })
    ));
}

#[test]
fn test_load_package_checks_metadata_layer_count() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join("count.hmod");
    let (kind, section) = encode_weights_section(&tiny_model(ModelArch::Transformer)).expect("test");
    let meta = PackageMetadata {
        vocab_size: 4,
        layer_count: 5,
        ..PackageMetadata::default()
    };
    let bytes = encode_package(&PackageHeader::new(Domain::Text, kind), &meta, &section);
    std::fs::write(&path, bytes).expect("test");
    assert!(load_package(&path, None).is_err());
}

#[test]
fn test_legacy_round_trip() {
    let dir = tempfile::tempdir().expect("test");
    let structure = dir.path().join("model.bin");
    let weights = dir.path().join("weights.bin");

    let mut model = tiny_model(ModelArch::RecurrentSequential);
    assert!(write_legacy(&model, &structure, &weights).is_err());
    model.requantize(BitWidth::Four).expect("test");
    write_legacy(&model, &structure, &weights).expect("test");

    let mut loaded = load_legacy(&structure, &weights, vocab(4)).expect("test");
    assert_eq!(loaded.arch(), ModelArch::RecurrentSequential);
    assert_eq!(loaded.hidden_size(), 4);
    assert_eq!(loaded.context_size(), 3);
    for (a, b) in model.layers().zip(loaded.layers()) {
        assert_eq!(a.weights(), b.weights());
    }
    assert_eq!(argmax(&loaded.forward(&[0, 3]).expect("test")), 3);

    // Sniffing falls back to the legacy pair and sizes the vocabulary
    let sniffed = load_model(&structure, Some(weights.as_path()), None).expect("test");
    assert_eq!(sniffed.vocabulary().token_count(), 4);
}

#[test]
fn test_legacy_rejects_mismatched_weights_file() {
    let dir = tempfile::tempdir().expect("test");
    let structure = dir.path().join("model.bin");
    let weights = dir.path().join("weights.bin");
    let mut model = tiny_model(ModelArch::Transformer);
    model.requantize(BitWidth::Four).expect("test");
    write_legacy(&model, &structure, &weights).expect("test");

    // Flip the first layer's input size in the weights file
    let mut bytes = std::fs::read(&weights).expect("test");
    bytes[16..20].copy_from_slice(&5u32.to_le_bytes());
    std::fs::write(&weights, &bytes).expect("test");
    assert!(load_legacy(&structure, &weights, vocab(4)).is_err());

    // Bad magic on the structure file
    let mut bytes = std::fs::read(&structure).expect("test");
    bytes[0] ^= 0xFF;
    std::fs::write(&structure, &bytes).expect("test");
    assert!(load_legacy(&structure, &weights, vocab(4)).is_err());
}

#[test]
fn test_legacy_oversized_header_returns_error() {
    let dir = tempfile::tempdir().expect("test");
    let structure = dir.path().join("model.bin");
    let weights = dir.path().join("weights.bin");

    let mut bytes = Vec::new();
    for field in [loader::LEGACY_MAGIC, loader::LEGACY_VERSION, 0, 1 << 22, 1 << 22, 0] {
        bytes.extend_from_slice(&field.to_le_bytes());
    }
    std::fs::write(&structure, &bytes).expect("test");
    std::fs::write(&weights, &bytes).expect("test");

    assert!(matches!(
        load_legacy(&structure, &weights, vocab(4)),
        Err(HyperionError::OutOfMemory { .. })
    ));
}

#[test]
fn test_decode_oversized_header_returns_error() {
    let model = tiny_model(ModelArch::Transformer);
    let (kind, mut section) = encode_weights_section(&model).expect("test");
    section[8..12].copy_from_slice(&(1u32 << 22).to_le_bytes());
    section[12..16].copy_from_slice(&(1u32 << 22).to_le_bytes());
    assert!(matches!(
        decode_weights_section(&section, kind, vocab(4)),
        Err(HyperionError::OutOfMemory { .. })
    ));
}

#[test]
fn test_load_model_with_tokenizer_file() {
    let dir = tempfile::tempdir().expect("test");
    let path = dir.path().join("tiny.hmod");
    let vocab_path = dir.path().join("vocab.txt");
    std::fs::write(&vocab_path, "<unk>\n<s>\n</s>\n<pad>\n").expect("test");
    save_package(&tiny_model(ModelArch::Transformer), &path, &PackageMetadata::default())
        .expect("test");

    let model = load_model(&path, None, Some(vocab_path.as_path())).expect("test");
    assert_eq!(model.vocabulary().token_text(2), Some("</s>"));

    let missing = dir.path().join("missing.bin");
    assert!(load_model(&missing, None, None).is_err());
}
