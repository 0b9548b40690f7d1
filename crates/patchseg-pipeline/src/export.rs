//! Classifier export to a portable ONNX inference graph.
//!
//! The fitted classifier serializes into a three-node graph,
//! `MatMul → Add → Sigmoid`, with one dynamically-sized input so a single
//! artifact scores any number of patches per call. The bytes are handed to
//! the caller unopened; uploading them is the dataset store's concern.

use patchseg_core::{PatchSegError, Result};
use prost::Message;

use crate::onnx_proto::{
    DimensionProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    TensorShapeProto, TensorTypeProto, TypeProto, ValueInfoProto, DATA_TYPE_FLOAT,
};
use crate::trainer::LinearClassifier;

/// Name of the single graph input: `[num_patches, feature_dim]` float32.
pub const GRAPH_INPUT_NAME: &str = "patch_features";

/// Name of the single graph output: `[num_patches, 1]` float32 foreground
/// probabilities.
pub const GRAPH_OUTPUT_NAME: &str = "scores";

/// ONNX operator-set version the graph is pinned to.
pub const OPSET_VERSION: i64 = 17;

/// ONNX IR version recorded in the model envelope.
pub const IR_VERSION: i64 = 8;

/// Symbolic name of the dynamic patch dimension.
const DYNAMIC_DIM: &str = "num_patches";

/// Serialize a fitted classifier into ONNX bytes.
///
/// # Errors
///
/// Returns [`PatchSegError::GraphExport`] when the classifier has a zero
/// feature dimension.
pub fn export_classifier(classifier: &LinearClassifier) -> Result<Vec<u8>> {
    let dim = classifier.feature_dim();
    if dim == 0 {
        return Err(PatchSegError::GraphExport(
            "classifier has zero feature dimension".to_string(),
        ));
    }

    let weight = TensorProto {
        dims: vec![dim as i64, 1],
        data_type: DATA_TYPE_FLOAT,
        name: "weight".to_string(),
        raw_data: le_bytes(&classifier.weights),
    };
    let bias = TensorProto {
        dims: vec![1],
        data_type: DATA_TYPE_FLOAT,
        name: "bias".to_string(),
        raw_data: le_bytes(&[classifier.bias]),
    };

    let nodes = vec![
        node("linear_score", "MatMul", &[GRAPH_INPUT_NAME, "weight"], "linear"),
        node("add_bias", "Add", &["linear", "bias"], "logits"),
        node("sigmoid", "Sigmoid", &["logits"], GRAPH_OUTPUT_NAME),
    ];

    let input = ValueInfoProto {
        name: GRAPH_INPUT_NAME.to_string(),
        r#type: Some(tensor_type(&[
            DimensionProto::dynamic(DYNAMIC_DIM),
            DimensionProto::fixed(dim as i64),
        ])),
    };
    let output = ValueInfoProto {
        name: GRAPH_OUTPUT_NAME.to_string(),
        r#type: Some(tensor_type(&[
            DimensionProto::dynamic(DYNAMIC_DIM),
            DimensionProto::fixed(1),
        ])),
    };

    let model = ModelProto {
        ir_version: IR_VERSION,
        producer_name: "patchseg".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        domain: String::new(),
        model_version: 1,
        doc_string: "Per-patch foreground classifier over frozen patch embeddings".to_string(),
        graph: Some(GraphProto {
            node: nodes,
            name: "patch_classifier".to_string(),
            initializer: vec![weight, bias],
            doc_string: String::new(),
            input: vec![input],
            output: vec![output],
        }),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: OPSET_VERSION,
        }],
    };

    Ok(model.encode_to_vec())
}

/// Reconstruct the linear classifier from exported graph bytes.
///
/// Used to verify an artifact scores identically to the in-memory
/// classifier it came from.
///
/// # Errors
///
/// Returns [`PatchSegError::GraphExport`] when the bytes do not decode or
/// the expected initializers are missing or malformed.
pub fn decode_classifier(bytes: &[u8]) -> Result<LinearClassifier> {
    let model = ModelProto::decode(bytes)
        .map_err(|e| PatchSegError::GraphExport(format!("model decode: {e}")))?;
    let graph = model
        .graph
        .ok_or_else(|| PatchSegError::GraphExport("model has no graph".to_string()))?;

    let weights = initializer_floats(&graph, "weight")?;
    let bias = initializer_floats(&graph, "bias")?;
    if weights.is_empty() || bias.len() != 1 {
        return Err(PatchSegError::GraphExport(format!(
            "unexpected initializer sizes: weight={}, bias={}",
            weights.len(),
            bias.len()
        )));
    }

    Ok(LinearClassifier {
        weights,
        bias: bias[0],
    })
}

fn node(name: &str, op_type: &str, inputs: &[&str], output: &str) -> NodeProto {
    NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: vec![output.to_string()],
        name: name.to_string(),
        op_type: op_type.to_string(),
    }
}

fn tensor_type(dims: &[DimensionProto]) -> TypeProto {
    TypeProto {
        tensor_type: Some(TensorTypeProto {
            elem_type: DATA_TYPE_FLOAT,
            shape: Some(TensorShapeProto { dim: dims.to_vec() }),
        }),
    }
}

fn le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn initializer_floats(graph: &GraphProto, name: &str) -> Result<Vec<f32>> {
    let tensor = graph
        .initializer
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| PatchSegError::GraphExport(format!("initializer '{name}' not found")))?;
    if tensor.data_type != DATA_TYPE_FLOAT || tensor.raw_data.len() % 4 != 0 {
        return Err(PatchSegError::GraphExport(format!(
            "initializer '{name}' is not packed float32"
        )));
    }
    Ok(tensor
        .raw_data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
