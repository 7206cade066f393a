//! Model loading and saving
//!
//! Two on-disk forms are supported:
//!
//! 1. **Package** (see [`crate::format`]): a single checksummed file whose
//!    weights section is laid out as below.
//! 2. **Legacy two-file**: a structure file plus a 4-bit weights file.
//!
//! ## Weights section
//!
//! ```text
//! model_type:u32  layer_count:u32  hidden_size:u32  context_size:u32
//! per layer:
//!   layer_type:u32  input_size:u32  output_size:u32  activation:u32
//!   scale:f32  zero_point:f32  weight_bytes:u32  bias_bytes:u32
//!   weights[weight_bytes]  bias[output_size] (f32)
//! ```
//!
//! Loads are all-or-nothing: any error drops every layer built so far and
//! no model is returned.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Activation, LayerKind, Model, ModelArch};
use crate::error::{HyperionError, Result};
use crate::format::{
    read_package, write_package, Capabilities, Domain, PackageHeader, PackageMetadata,
    QuantizationKind, MAGIC,
};
use crate::quantize::{BitWidth, QuantizedBuffer};
use crate::vocab::{FixedVocabulary, TokenTable, Vocabulary};

/// Magic of both legacy files
pub const LEGACY_MAGIC: u32 = 0x4D49_4E54;

/// Version written to legacy files
pub const LEGACY_VERSION: u32 = 1;

/// Bounds-checked little-endian reader
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| HyperionError::FormatError {
                reason: format!(
                    "{} truncated: need {n} bytes at offset {}, have {}",
                    self.what,
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ),
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn f32_vec(&mut self, count: usize) -> Result<Vec<f32>> {
        let bytes = self.take(count.checked_mul(4).ok_or_else(|| HyperionError::FormatError {
            reason: format!("{}: float count {count} overflows", self.what),
        })?)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn to_u32(value: usize, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| HyperionError::InvalidShape {
        reason: format!("{field} {value} does not fit in 32 bits"),
    })
}

fn element_count(input_size: u32, output_size: u32, layer: usize) -> Result<usize> {
    (input_size as usize)
        .checked_mul(output_size as usize)
        .filter(|count| count.checked_mul(16).is_some())
        .ok_or_else(|| HyperionError::FormatError {
            reason: format!("Layer {layer}: {input_size}x{output_size} overflows"),
        })
}

/// Widest bit width whose packed size for `count` values is `weight_bytes`
///
/// # Errors
///
/// Returns error if no supported width matches.
pub fn infer_bit_width(count: usize, weight_bytes: usize) -> Result<BitWidth> {
    BitWidth::ALL
        .iter()
        .rev()
        .copied()
        .find(|bw| bw.packed_len(count) == weight_bytes)
        .ok_or_else(|| HyperionError::FormatError {
            reason: format!("No bit width packs {count} values into {weight_bytes} bytes"),
        })
}

fn declared_bit_width(quantization: QuantizationKind) -> Result<Option<BitWidth>> {
    match quantization {
        QuantizationKind::Int4 => Ok(Some(BitWidth::Four)),
        QuantizationKind::Int8 => Ok(Some(BitWidth::Eight)),
        QuantizationKind::Unknown => Ok(None),
        QuantizationKind::Fp32 => Err(HyperionError::UnsupportedOperation {
            operation: "load_package".to_string(),
            reason: "FP32 weights are not supported".to_string(),
        }),
    }
}

/// Decode a package weights section into a model
///
/// # Errors
///
/// Returns error on truncation, a zero layer count, a layer with no weight
/// bytes, a bias length other than `output_size * 4`, a weight length that
/// does not match the layer shape, unknown tags, or trailing bytes.
pub fn decode_weights_section(
    data: &[u8],
    quantization: QuantizationKind,
    vocab: Arc<dyn Vocabulary>,
) -> Result<Model> {
    let fixed_width = declared_bit_width(quantization)?;
    let mut r = ByteReader::new(data, "weights section");

    let arch = ModelArch::from_tag(r.u32()?)?;
    let layer_count = r.u32()?;
    let hidden_size = r.u32()?;
    let context_size = r.u32()?;
    if layer_count == 0 {
        return Err(HyperionError::FormatError {
            reason: "Weights section declares zero layers".to_string(),
        });
    }

    let mut model = Model::new(arch, hidden_size as usize, context_size as usize, vocab)?;
    for i in 0..layer_count as usize {
        let kind = LayerKind::from_tag(r.u32()?)?;
        let input_size = r.u32()?;
        let output_size = r.u32()?;
        let activation = Activation::from_tag(r.u32()?)?;
        let scale = r.f32()?;
        let zero_point = r.f32()?;
        let weight_bytes = r.u32()? as usize;
        let bias_bytes = r.u32()? as usize;

        if weight_bytes == 0 {
            return Err(HyperionError::FormatError {
                reason: format!("Layer {i} has no weight bytes"),
            });
        }
        if bias_bytes != output_size as usize * 4 {
            return Err(HyperionError::FormatError {
                reason: format!(
                    "Layer {i} bias is {bias_bytes} bytes, expected {} for {output_size} outputs",
                    output_size as usize * 4
                ),
            });
        }
        let count = element_count(input_size, output_size, i)?;
        let bit_width = match fixed_width {
            Some(bw) => bw,
            None => infer_bit_width(count, weight_bytes)?,
        };
        if bit_width.packed_len(count) != weight_bytes {
            return Err(HyperionError::FormatError {
                reason: format!(
                    "Layer {i} has {weight_bytes} weight bytes, expected {} at {bit_width}",
                    bit_width.packed_len(count)
                ),
            });
        }

        let packed = r.take(weight_bytes)?.to_vec();
        let bias = r.f32_vec(output_size as usize)?;

        let idx = model.add_layer(kind, input_size as usize, output_size as usize, activation)?;
        let weights = QuantizedBuffer::from_packed(
            packed,
            count,
            bit_width,
            scale,
            zero_point.round() as i32,
        )?;
        model.set_layer_weights(idx, weights, Some(bias))?;
        debug!(layer = i, ?kind, input_size, output_size, %bit_width, "decoded layer");
    }

    if r.remaining() != 0 {
        return Err(HyperionError::FormatError {
            reason: format!("{} trailing bytes after last layer", r.remaining()),
        });
    }
    Ok(model)
}

/// Package quantization tag that describes every layer of `model`
fn quantization_kind(model: &Model) -> Result<QuantizationKind> {
    let mut widths = Vec::with_capacity(model.layer_count());
    for (i, layer) in model.layers().enumerate() {
        let weights = layer.weights().ok_or_else(|| {
            HyperionError::InvalidConfiguration(format!("Layer {i} has no weights to save"))
        })?;
        widths.push(weights.bit_width());
    }

    if widths.iter().all(|&w| w == BitWidth::Four) {
        return Ok(QuantizationKind::Int4);
    }
    if widths.iter().all(|&w| w == BitWidth::Eight) {
        return Ok(QuantizationKind::Int8);
    }
    for (i, layer) in model.layers().enumerate() {
        let count = layer.input_size() * layer.output_size();
        let inferred = infer_bit_width(count, widths[i].packed_len(count))?;
        if inferred != widths[i] {
            return Err(HyperionError::UnsupportedOperation {
                operation: "save_package".to_string(),
                reason: format!(
                    "Layer {i} at {} would be read back as {inferred}; its width cannot be recorded",
                    widths[i]
                ),
            });
        }
    }
    Ok(QuantizationKind::Unknown)
}

/// Encode a model as a package weights section
///
/// Missing biases are written as zeros.
///
/// # Errors
///
/// Returns error if a layer has no weights, a size exceeds 32 bits, or
/// the layer widths are mixed in a way the section cannot record.
pub fn encode_weights_section(model: &Model) -> Result<(QuantizationKind, Vec<u8>)> {
    let quantization = quantization_kind(model)?;

    let mut out = Vec::with_capacity(16 + model.weight_bytes() + model.parameter_count() * 4);
    put_u32(&mut out, model.arch().tag());
    put_u32(&mut out, to_u32(model.layer_count(), "layer count")?);
    put_u32(&mut out, to_u32(model.hidden_size(), "hidden size")?);
    put_u32(&mut out, to_u32(model.context_size(), "context size")?);

    for layer in model.layers() {
        let weights = layer.weights().ok_or_else(|| {
            HyperionError::InvalidConfiguration("Layer has no weights to save".to_string())
        })?;
        put_u32(&mut out, layer.kind().tag());
        put_u32(&mut out, to_u32(layer.input_size(), "input size")?);
        put_u32(&mut out, to_u32(layer.output_size(), "output size")?);
        put_u32(&mut out, layer.activation().tag());
        put_f32(&mut out, weights.scale());
        put_f32(&mut out, weights.zero_point() as f32);
        put_u32(&mut out, to_u32(weights.memory_bytes(), "weight bytes")?);
        put_u32(&mut out, to_u32(layer.output_size() * 4, "bias bytes")?);
        out.extend_from_slice(weights.as_bytes());
        match layer.bias() {
            Some(bias) => bias.iter().for_each(|&b| put_f32(&mut out, b)),
            None => (0..layer.output_size()).for_each(|_| put_f32(&mut out, 0.0)),
        }
    }
    Ok((quantization, out))
}

/// Save `model` as a text-domain package
///
/// The metadata's layer count, hidden size and context size are taken from
/// the model. Vocabulary size, context window and embedding size are filled
/// from the model when left at zero.
///
/// # Errors
///
/// Returns error if the model cannot be encoded or the file cannot be written.
pub fn save_package(model: &Model, path: impl AsRef<Path>, metadata: &PackageMetadata) -> Result<()> {
    let (quantization, weights) = encode_weights_section(model)?;

    let mut header = PackageHeader::new(Domain::Text, quantization);
    header.parameter_count = model.parameter_count() as u64;
    header.capabilities = Capabilities::TEXT_GENERATION;

    let mut metadata = metadata.clone();
    metadata.layer_count = to_u32(model.layer_count(), "layer count")?;
    metadata.hidden_size = to_u32(model.hidden_size(), "hidden size")?;
    metadata.context_size = to_u32(model.context_size(), "context size")?;
    if metadata.vocab_size == 0 {
        metadata.vocab_size = to_u32(model.vocabulary().token_count(), "vocabulary size")?;
    }
    if metadata.context_window == 0 {
        metadata.context_window = metadata.context_size;
    }
    if metadata.embedding_size == 0 {
        metadata.embedding_size = metadata.hidden_size;
    }

    write_package(path.as_ref(), &header, &metadata, &weights)?;
    info!(
        path = %path.as_ref().display(),
        layers = model.layer_count(),
        ?quantization,
        "saved package"
    );
    Ok(())
}

/// Load a text-domain package
///
/// Without a vocabulary, one sized from the metadata is used.
///
/// # Errors
///
/// Returns error if verification fails, the domain is not text, the
/// weights section is malformed, or the metadata layer count disagrees
/// with the weights section.
pub fn load_package(path: impl AsRef<Path>, vocab: Option<Arc<dyn Vocabulary>>) -> Result<Model> {
    let path = path.as_ref();
    let package = read_package(path)?;
    if package.header.domain != Domain::Text {
        return Err(HyperionError::UnsupportedOperation {
            operation: "load_package".to_string(),
            reason: format!("{:?} packages cannot be loaded as text models", package.header.domain),
        });
    }

    let metadata = &package.metadata;
    let vocab = match vocab {
        Some(v) => v,
        None if metadata.vocab_size > 0 => Arc::new(FixedVocabulary(metadata.vocab_size as usize)),
        None => {
            return Err(HyperionError::FormatError {
                reason: "Package declares no vocabulary size and none was supplied".to_string(),
            })
        },
    };
    if metadata.vocab_size != 0 && metadata.vocab_size as usize != vocab.token_count() {
        warn!(
            declared = metadata.vocab_size,
            actual = vocab.token_count(),
            "package vocabulary size differs from supplied vocabulary"
        );
    }

    let model = decode_weights_section(&package.weights, package.header.quantization, vocab)?;
    if metadata.layer_count != 0 && metadata.layer_count as usize != model.layer_count() {
        return Err(HyperionError::FormatError {
            reason: format!(
                "Metadata declares {} layers, weights section has {}",
                metadata.layer_count,
                model.layer_count()
            ),
        });
    }

    info!(
        path = %path.display(),
        model = %metadata.model_name,
        layers = model.layer_count(),
        "loaded package"
    );
    Ok(model)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| HyperionError::IoError {
        message: format!("Failed to open '{}': {e}", path.display()),
    })?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).map_err(|e| HyperionError::IoError {
        message: format!("Failed to read '{}': {e}", path.display()),
    })?;
    Ok(data)
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| HyperionError::IoError {
        message: format!("Failed to create '{}': {e}", path.display()),
    })?;
    file.write_all(data).map_err(|e| HyperionError::IoError {
        message: format!("Failed to write '{}': {e}", path.display()),
    })
}

/// True if the file starts with the package magic
fn has_package_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|()| u32::from_le_bytes(magic) == MAGIC)
        .unwrap_or(false)
}

/// Load a legacy structure file and its 4-bit weights file
///
/// The weights file repeats each layer's type and sizes, which must match
/// the structure file. The legacy version field is not checked.
///
/// # Errors
///
/// Returns error on bad magic, truncation, or any layer mismatch.
pub fn load_legacy(
    structure_path: impl AsRef<Path>,
    weights_path: impl AsRef<Path>,
    vocab: Arc<dyn Vocabulary>,
) -> Result<Model> {
    let structure = read_file(structure_path.as_ref())?;
    let mut r = ByteReader::new(&structure, "legacy structure file");
    let magic = r.u32()?;
    if magic != LEGACY_MAGIC {
        return Err(HyperionError::FormatError {
            reason: format!("Invalid legacy magic: expected {LEGACY_MAGIC:#010x}, got {magic:#010x}"),
        });
    }
    let _version = r.u32()?;
    let arch = ModelArch::from_tag(r.u32()?)?;
    let hidden_size = r.u32()? as usize;
    let context_size = r.u32()? as usize;
    let layer_count = r.u32()? as usize;

    let mut model = Model::new(arch, hidden_size, context_size, vocab)?;
    for _ in 0..layer_count {
        let kind = LayerKind::from_tag(r.u32()?)?;
        let input_size = r.u32()? as usize;
        let output_size = r.u32()? as usize;
        let activation = Activation::from_tag(r.u32()?)?;
        model.add_layer(kind, input_size, output_size, activation)?;
    }

    let weights = read_file(weights_path.as_ref())?;
    let mut r = ByteReader::new(&weights, "legacy weights file");
    let magic = r.u32()?;
    let _version = r.u32()?;
    let count = r.u32()? as usize;
    if magic != LEGACY_MAGIC || count != model.layer_count() {
        return Err(HyperionError::FormatError {
            reason: format!(
                "Legacy weights header mismatch (magic {magic:#010x}, {count} layers, expected {})",
                model.layer_count()
            ),
        });
    }

    for i in 0..count {
        let kind = r.u32()?;
        let input_size = r.u32()?;
        let output_size = r.u32()?;
        let (expected_kind, expected_in, expected_out) = {
            let layer = model.layer(i).ok_or_else(|| HyperionError::FormatError {
                reason: format!("Layer {i} missing from structure"),
            })?;
            (layer.kind().tag(), layer.input_size(), layer.output_size())
        };
        if kind != expected_kind
            || input_size as usize != expected_in
            || output_size as usize != expected_out
        {
            return Err(HyperionError::FormatError {
                reason: format!(
                    "Legacy layer {i} is type {kind} {input_size}x{output_size}, structure says type {expected_kind} {expected_in}x{expected_out}"
                ),
            });
        }

        let scale = r.f32()?;
        let zero_point = r.f32()?;
        let n = element_count(input_size, output_size, i)?;
        let packed = r.take(BitWidth::Four.packed_len(n))?.to_vec();
        let bias = r.f32_vec(expected_out)?;
        let buffer =
            QuantizedBuffer::from_packed(packed, n, BitWidth::Four, scale, zero_point.round() as i32)?;
        model.set_layer_weights(i, buffer, Some(bias))?;
    }

    info!(layers = model.layer_count(), "loaded legacy model");
    Ok(model)
}

/// Write `model` in the legacy two-file form
///
/// # Errors
///
/// Returns error if a layer has no weights, a layer is not 4-bit, or a
/// file cannot be written.
pub fn write_legacy(
    model: &Model,
    structure_path: impl AsRef<Path>,
    weights_path: impl AsRef<Path>,
) -> Result<()> {
    let mut structure = Vec::new();
    put_u32(&mut structure, LEGACY_MAGIC);
    put_u32(&mut structure, LEGACY_VERSION);
    put_u32(&mut structure, model.arch().tag());
    put_u32(&mut structure, to_u32(model.hidden_size(), "hidden size")?);
    put_u32(&mut structure, to_u32(model.context_size(), "context size")?);
    put_u32(&mut structure, to_u32(model.layer_count(), "layer count")?);

    let mut weights = Vec::new();
    put_u32(&mut weights, LEGACY_MAGIC);
    put_u32(&mut weights, LEGACY_VERSION);
    put_u32(&mut weights, to_u32(model.layer_count(), "layer count")?);

    for (i, layer) in model.layers().enumerate() {
        let input_size = to_u32(layer.input_size(), "input size")?;
        let output_size = to_u32(layer.output_size(), "output size")?;
        put_u32(&mut structure, layer.kind().tag());
        put_u32(&mut structure, input_size);
        put_u32(&mut structure, output_size);
        put_u32(&mut structure, layer.activation().tag());

        let buffer = layer.weights().ok_or_else(|| {
            HyperionError::InvalidConfiguration(format!("Layer {i} has no weights to save"))
        })?;
        if buffer.bit_width() != BitWidth::Four {
            return Err(HyperionError::UnsupportedOperation {
                operation: "write_legacy".to_string(),
                reason: format!("Layer {i} is {}; the legacy format stores 4-bit weights", buffer.bit_width()),
            });
        }
        put_u32(&mut weights, layer.kind().tag());
        put_u32(&mut weights, input_size);
        put_u32(&mut weights, output_size);
        put_f32(&mut weights, buffer.scale());
        put_f32(&mut weights, buffer.zero_point() as f32);
        weights.extend_from_slice(buffer.as_bytes());
        match layer.bias() {
            Some(bias) => bias.iter().for_each(|&b| put_f32(&mut weights, b)),
            None => (0..layer.output_size()).for_each(|_| put_f32(&mut weights, 0.0)),
        }
    }

    write_file(structure_path.as_ref(), &structure)?;
    write_file(weights_path.as_ref(), &weights)
}

/// Load a model from a package or the legacy pair
///
/// `model_path` is tried as a package first, then `weights_path`. If
/// neither starts with the package magic, `model_path` is read as a legacy
/// structure file and `weights_path` as its weights file. The vocabulary is
/// read from `tokenizer_path` (one token per line) when given.
///
/// # Errors
///
/// Returns error if the vocabulary or model cannot be loaded.
pub fn load_model(
    model_path: impl AsRef<Path>,
    weights_path: Option<&Path>,
    tokenizer_path: Option<&Path>,
) -> Result<Model> {
    let vocab: Option<Arc<dyn Vocabulary>> = match tokenizer_path {
        Some(p) => Some(Arc::new(TokenTable::from_file(p)?)),
        None => None,
    };
    load_model_with_vocabulary(model_path, weights_path, vocab)
}

/// [`load_model`] with an already-loaded vocabulary
///
/// A legacy model loaded without a vocabulary gets one sized to the final
/// layer's output width.
///
/// # Errors
///
/// Returns error if the model cannot be loaded.
pub fn load_model_with_vocabulary(
    model_path: impl AsRef<Path>,
    weights_path: Option<&Path>,
    vocab: Option<Arc<dyn Vocabulary>>,
) -> Result<Model> {
    let model_path = model_path.as_ref();
    if has_package_magic(model_path) {
        return load_package(model_path, vocab);
    }
    if let Some(weights) = weights_path.filter(|p| has_package_magic(p)) {
        return load_package(weights, vocab);
    }

    let weights_path = weights_path.ok_or_else(|| {
        HyperionError::InvalidConfiguration(format!(
            "'{}' is not a package and no weights file was given",
            model_path.display()
        ))
    })?;
    let vocab = match vocab {
        Some(v) => v,
        None => legacy_vocabulary(model_path)?,
    };
    load_legacy(model_path, weights_path, vocab)
}

/// Vocabulary sized to the last layer of a legacy structure file
fn legacy_vocabulary(structure_path: &Path) -> Result<Arc<dyn Vocabulary>> {
    let data = read_file(structure_path)?;
    let mut r = ByteReader::new(&data, "legacy structure file");
    r.take(12)?;
    let _hidden = r.u32()?;
    let _context = r.u32()?;
    let layer_count = r.u32()? as usize;
    if layer_count == 0 {
        return Err(HyperionError::FormatError {
            reason: "Legacy structure declares zero layers".to_string(),
        });
    }
    r.take((layer_count - 1).saturating_mul(16))?;
    let _kind = r.u32()?;
    let _input = r.u32()?;
    let output = r.u32()? as usize;
    Ok(Arc::new(FixedVocabulary(output)))
}
