//! ONNX形式へのエクスポート
//!
//! PCAとSVMをそれぞれ部分グラフにし、`pca_output` → `svm_input` で結合したうえで、
//! 確率系の出力（`probabilities` とシーケンス型出力）を取り除いて
//! `label` のみを出力するモデルを作ります。
//!
//! グラフにはタイムスタンプを含めないため、同じパラメータからは
//! 常にバイト単位で同一のファイルが得られます。

pub mod graph;
pub mod onnx_proto;

use std::path::Path;

use prost::Message;

use crate::error::{PipelineError, Result};
use crate::ml::pca::Pca;
use crate::ml::svm::Svm;
use crate::types::Label;
use graph::{AttrValue, ElemType, Graph, Initializer, Node, ValueInfo, ValueType};
use onnx_proto::{ModelProto, OperatorSetIdProto};

pub const IR_VERSION: i64 = 8;
pub const OPSET_VERSION: i64 = 18;
pub const ML_OPSET_VERSION: i64 = 3;
pub const ML_DOMAIN: &str = "ai.onnx.ml";
pub const PRODUCER_NAME: &str = "clip_classifier";

pub const PCA_INPUT: &str = "pca_input";
pub const PCA_OUTPUT: &str = "pca_output";
pub const SVM_INPUT: &str = "svm_input";
pub const LABEL_OUTPUT: &str = "label";
const PROBABILITIES: &str = "probabilities";

/// PCA部分グラフ: Sub(mean) → MatMul(componentsᵀ)
pub fn build_reducer_graph(pca: &Pca) -> Graph {
    let d = pca.input_dim();
    let k = pca.output_dim();

    let mut g = Graph::new("pca");
    g.inputs.push(ValueInfo::batch_matrix(PCA_INPUT, ElemType::Float, d));
    g.outputs.push(ValueInfo::batch_matrix(PCA_OUTPUT, ElemType::Float, k));
    g.initializers.push(Initializer {
        name: "pca_mean".to_string(),
        dims: vec![d],
        data: pca.mean().to_vec(),
    });
    g.initializers.push(Initializer {
        name: "pca_components_t".to_string(),
        dims: vec![d, k],
        data: pca.components().t().iter().copied().collect(),
    });
    g.nodes.push(Node::new("pca_sub", "Sub", &[PCA_INPUT, "pca_mean"], &["pca_centered"]));
    g.nodes.push(Node::new(
        "pca_matmul",
        "MatMul",
        &["pca_centered", "pca_components_t"],
        &[PCA_OUTPUT],
    ));
    g
}

/// SVM部分グラフ: SVMClassifier → label / probability_tensor → Identity → ZipMap
///
/// SVMClassifier の二値判定は「スコア > 0 なら先頭クラス」なので、
/// 係数と rho の符号を反転して元の決定関数と一致させます。
pub fn build_classifier_graph(svm: &Svm) -> Graph {
    let k = svm.n_features();
    let classes: Vec<i64> = Label::ALL.iter().map(|l| i64::from(*l)).collect();

    let mut g = Graph::new("svm");
    g.inputs.push(ValueInfo::batch_matrix(SVM_INPUT, ElemType::Float, k));
    g.outputs.push(ValueInfo::batch_vector(LABEL_OUTPUT, ElemType::Int64));
    g.outputs.push(ValueInfo::batch_matrix(PROBABILITIES, ElemType::Float, classes.len()));
    g.outputs.push(ValueInfo {
        name: "output_probability".to_string(),
        ty: ValueType::SequenceOfMaps {
            key: ElemType::Int64,
            value: ElemType::Float,
        },
    });

    let [n_neg, n_pos] = svm.n_support();
    g.nodes.push(
        Node::new("svm_classifier", "SVMClassifier", &[SVM_INPUT], &[LABEL_OUTPUT, "probability_tensor"])
            .with_domain(ML_DOMAIN)
            .with_attr("classlabels_ints", AttrValue::Ints(classes.clone()))
            .with_attr(
                "coefficients",
                AttrValue::Floats(svm.dual_coef().iter().map(|c| -(*c) as f32).collect()),
            )
            .with_attr("kernel_params", AttrValue::Floats(svm.kernel().onnx_kernel_params().to_vec()))
            .with_attr("kernel_type", AttrValue::String(svm.kernel().onnx_kernel_type().to_string()))
            .with_attr("post_transform", AttrValue::String("NONE".to_string()))
            .with_attr("rho", AttrValue::Floats(vec![-svm.bias() as f32]))
            .with_attr(
                "support_vectors",
                AttrValue::Floats(svm.support_vectors().iter().copied().collect()),
            )
            .with_attr("vectors_per_class", AttrValue::Ints(vec![n_neg as i64, n_pos as i64])),
    );
    g.nodes.push(Node::new("svm_identity", "Identity", &["probability_tensor"], &[PROBABILITIES]));
    g.nodes.push(
        Node::new("svm_zipmap", "ZipMap", &[PROBABILITIES], &["output_probability"])
            .with_domain(ML_DOMAIN)
            .with_attr("classlabels_int64s", AttrValue::Ints(classes)),
    );
    g
}

/// PCA（任意）とSVMから `label` のみを出力するONNXモデルを構築
pub fn build_model(pca: Option<&Pca>, svm: &Svm, input_dim: usize) -> Result<ModelProto> {
    let classifier = build_classifier_graph(svm);
    let mut graph = match pca {
        Some(pca) => {
            if pca.input_dim() != input_dim {
                return Err(PipelineError::ExportShapeMismatch {
                    producer: "input".to_string(),
                    consumer: PCA_INPUT.to_string(),
                    producer_width: input_dim,
                    consumer_width: pca.input_dim(),
                });
            }
            Graph::merge(build_reducer_graph(pca), classifier, &[(PCA_OUTPUT, SVM_INPUT)])?
        }
        None => {
            if svm.n_features() != input_dim {
                return Err(PipelineError::ExportShapeMismatch {
                    producer: "input".to_string(),
                    consumer: SVM_INPUT.to_string(),
                    producer_width: input_dim,
                    consumer_width: svm.n_features(),
                });
            }
            classifier
        }
    };

    graph.prune_outputs(|v| v.is_sequence() || v.name == PROBABILITIES);
    if graph.outputs.len() != 1 || graph.outputs[0].name != LABEL_OUTPUT {
        return Err(PipelineError::InvalidArgument(format!(
            "exported graph must have a single '{}' output, found {:?}",
            LABEL_OUTPUT,
            graph.outputs.iter().map(|v| v.name.as_str()).collect::<Vec<_>>()
        )));
    }

    Ok(ModelProto {
        ir_version: IR_VERSION,
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph.to_proto()),
        opset_import: vec![
            OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            },
            OperatorSetIdProto {
                domain: ML_DOMAIN.to_string(),
                version: ML_OPSET_VERSION,
            },
        ],
        ..Default::default()
    })
}

/// モデルをprotobufバイト列にする
pub fn encode_model(model: &ModelProto) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf)?;
    Ok(buf)
}

/// protobufバイト列からモデルを読む
pub fn decode_model(bytes: &[u8]) -> Result<ModelProto> {
    Ok(ModelProto::decode(bytes)?)
}

/// パイプラインをONNXバイト列にエクスポート
pub fn export_pipeline(pca: Option<&Pca>, svm: &Svm, input_dim: usize) -> Result<Vec<u8>> {
    encode_model(&build_model(pca, svm, input_dim)?)
}

/// パイプラインをONNXファイルに書き出し、書き込んだバイト数を返す
pub fn export_to_file(path: &Path, pca: Option<&Pca>, svm: &Svm, input_dim: usize) -> Result<usize> {
    let bytes = export_pipeline(pca, svm, input_dim)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    std::fs::write(path, &bytes).map_err(|e| PipelineError::io(path, e))?;
    log::info!("ONNXモデルを書き出しました: {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes.len())
}
