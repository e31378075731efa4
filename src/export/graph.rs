//! エクスポート用の中間グラフ表現
//!
//! 部分グラフの構築・結合・不要出力の削除をこの表現上で行い、
//! 最後に ONNX の `GraphProto` へ変換します。

use std::collections::HashSet;

use crate::error::{PipelineError, Result};
use crate::export::onnx_proto::{
    attribute_type, data_type, tensor_shape_proto, type_proto, AttributeProto, GraphProto,
    NodeProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

/// 要素型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    Float,
    Int64,
}

impl ElemType {
    fn onnx(self) -> i32 {
        match self {
            ElemType::Float => data_type::FLOAT,
            ElemType::Int64 => data_type::INT64,
        }
    }
}

/// テンソルの次元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    Symbolic(String),
}

/// 値の型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Tensor { elem: ElemType, shape: Vec<Dim> },
    /// マップのシーケンス（ZipMap の出力）
    SequenceOfMaps { key: ElemType, value: ElemType },
}

/// グラフの入出力
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub ty: ValueType,
}

impl ValueInfo {
    /// 可変バッチの2次元テンソル [N, width]
    pub fn batch_matrix(name: &str, elem: ElemType, width: usize) -> Self {
        Self {
            name: name.to_string(),
            ty: ValueType::Tensor {
                elem,
                shape: vec![Dim::Symbolic("N".to_string()), Dim::Fixed(width)],
            },
        }
    }

    /// 可変バッチの1次元テンソル [N]
    pub fn batch_vector(name: &str, elem: ElemType) -> Self {
        Self {
            name: name.to_string(),
            ty: ValueType::Tensor {
                elem,
                shape: vec![Dim::Symbolic("N".to_string())],
            },
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.ty, ValueType::SequenceOfMaps { .. })
    }

    /// 最終次元の幅（固定値の場合のみ）
    pub fn width(&self) -> Option<usize> {
        match &self.ty {
            ValueType::Tensor { shape, .. } => match shape.last() {
                Some(Dim::Fixed(w)) => Some(*w),
                _ => None,
            },
            ValueType::SequenceOfMaps { .. } => None,
        }
    }

    fn to_proto(&self) -> ValueInfoProto {
        ValueInfoProto {
            name: self.name.clone(),
            r#type: Some(type_to_proto(&self.ty)),
            doc_string: String::new(),
        }
    }
}

fn tensor_type(elem: ElemType, shape: &[Dim]) -> TypeProto {
    let dim = shape
        .iter()
        .map(|d| tensor_shape_proto::Dimension {
            value: Some(match d {
                Dim::Fixed(v) => tensor_shape_proto::dimension::Value::DimValue(*v as i64),
                Dim::Symbolic(p) => tensor_shape_proto::dimension::Value::DimParam(p.clone()),
            }),
        })
        .collect();
    TypeProto {
        value: Some(type_proto::Value::TensorType(type_proto::Tensor {
            elem_type: elem.onnx(),
            shape: Some(TensorShapeProto { dim }),
        })),
    }
}

fn type_to_proto(ty: &ValueType) -> TypeProto {
    match ty {
        ValueType::Tensor { elem, shape } => tensor_type(*elem, shape),
        ValueType::SequenceOfMaps { key, value } => {
            let map = TypeProto {
                value: Some(type_proto::Value::MapType(type_proto::Map {
                    key_type: key.onnx(),
                    value_type: Some(Box::new(tensor_type(*value, &[]))),
                })),
            };
            TypeProto {
                value: Some(type_proto::Value::SequenceType(type_proto::Sequence {
                    elem_type: Some(Box::new(map)),
                })),
            }
        }
    }
}

/// ノード属性
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl AttrValue {
    fn to_proto(&self, name: &str) -> AttributeProto {
        let mut attr = AttributeProto {
            name: name.to_string(),
            ..Default::default()
        };
        match self {
            AttrValue::Float(v) => {
                attr.r#type = attribute_type::FLOAT;
                attr.f = *v;
            }
            AttrValue::Int(v) => {
                attr.r#type = attribute_type::INT;
                attr.i = *v;
            }
            AttrValue::String(v) => {
                attr.r#type = attribute_type::STRING;
                attr.s = v.as_bytes().to_vec();
            }
            AttrValue::Floats(v) => {
                attr.r#type = attribute_type::FLOATS;
                attr.floats = v.clone();
            }
            AttrValue::Ints(v) => {
                attr.r#type = attribute_type::INTS;
                attr.ints = v.clone();
            }
            AttrValue::Strings(v) => {
                attr.r#type = attribute_type::STRINGS;
                attr.strings = v.iter().map(|s| s.as_bytes().to_vec()).collect();
            }
        }
        attr
    }
}

/// 演算ノード
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, AttrValue)>,
}

impl Node {
    pub fn new(name: &str, op_type: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            op_type: op_type.to_string(),
            domain: String::new(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attributes: Vec::new(),
        }
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn with_attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attributes.push((name.to_string(), value));
        self
    }

    fn to_proto(&self) -> NodeProto {
        NodeProto {
            input: self.inputs.clone(),
            output: self.outputs.clone(),
            name: self.name.clone(),
            op_type: self.op_type.clone(),
            attribute: self
                .attributes
                .iter()
                .map(|(name, value)| value.to_proto(name))
                .collect(),
            doc_string: String::new(),
            domain: self.domain.clone(),
        }
    }
}

/// 定数テンソル（float）
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl Initializer {
    fn to_proto(&self) -> TensorProto {
        TensorProto {
            dims: self.dims.iter().map(|d| *d as i64).collect(),
            data_type: data_type::FLOAT,
            float_data: self.data.clone(),
            name: self.name.clone(),
        }
    }
}

/// 計算グラフ（ノードは実行順に並ぶ）
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            nodes: Vec::new(),
            initializers: Vec::new(),
        }
    }

    pub fn input(&self, name: &str) -> Option<&ValueInfo> {
        self.inputs.iter().find(|v| v.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&ValueInfo> {
        self.outputs.iter().find(|v| v.name == name)
    }

    /// 2つのグラフを結合する
    ///
    /// `io_map` の各 (first の出力, second の入力) を接続し、second 側の入力名は
    /// first 側の出力名に置き換えます。接続されたテンソルの幅が異なる場合は
    /// `ExportShapeMismatch` です。
    pub fn merge(first: Graph, second: Graph, io_map: &[(&str, &str)]) -> Result<Graph> {
        for (producer, consumer) in io_map {
            let out = first.output(producer).ok_or_else(|| {
                PipelineError::InvalidArgument(format!("graph '{}' has no output '{}'", first.name, producer))
            })?;
            let inp = second.input(consumer).ok_or_else(|| {
                PipelineError::InvalidArgument(format!("graph '{}' has no input '{}'", second.name, consumer))
            })?;
            if out.width() != inp.width() {
                return Err(PipelineError::ExportShapeMismatch {
                    producer: producer.to_string(),
                    consumer: consumer.to_string(),
                    producer_width: out.width().unwrap_or(0),
                    consumer_width: inp.width().unwrap_or(0),
                });
            }
        }

        let consumed: HashSet<&str> = io_map.iter().map(|(_, c)| *c).collect();
        let connected: HashSet<&str> = io_map.iter().map(|(p, _)| *p).collect();
        let rename = |name: &String| -> String {
            io_map
                .iter()
                .find(|(_, c)| *c == name.as_str())
                .map(|(p, _)| p.to_string())
                .unwrap_or_else(|| name.clone())
        };

        let mut merged = Graph::new(&format!("{}_{}", first.name, second.name));
        merged.inputs = first.inputs.clone();
        merged
            .inputs
            .extend(second.inputs.iter().filter(|v| !consumed.contains(v.name.as_str())).cloned());
        merged.outputs = first
            .outputs
            .iter()
            .filter(|v| !connected.contains(v.name.as_str()))
            .cloned()
            .collect();
        merged.outputs.extend(second.outputs.iter().cloned());
        merged.nodes = first.nodes.clone();
        merged.nodes.extend(second.nodes.iter().map(|node| Node {
            inputs: node.inputs.iter().map(&rename).collect(),
            ..node.clone()
        }));
        merged.initializers = first.initializers.clone();
        merged.initializers.extend(second.initializers.iter().cloned());

        let mut names = HashSet::new();
        for init in &merged.initializers {
            if !names.insert(init.name.as_str()) {
                return Err(PipelineError::InvalidArgument(format!(
                    "duplicate initializer '{}' after merge",
                    init.name
                )));
            }
        }
        Ok(merged)
    }

    /// 条件に一致する出力を削除し、どの出力にも寄与しなくなったノードと定数を除去する
    pub fn prune_outputs(&mut self, remove: impl Fn(&ValueInfo) -> bool) {
        self.outputs.retain(|v| !remove(v));

        let mut live: HashSet<String> = self.outputs.iter().map(|v| v.name.clone()).collect();
        let mut kept = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.iter().rev() {
            if node.outputs.iter().any(|o| live.contains(o)) {
                live.extend(node.inputs.iter().cloned());
                kept.push(node.clone());
            } else {
                log::debug!("未使用ノードを削除: {} ({})", node.name, node.op_type);
            }
        }
        kept.reverse();
        self.nodes = kept;
        self.initializers.retain(|init| live.contains(&init.name));
    }

    pub fn to_proto(&self) -> GraphProto {
        GraphProto {
            node: self.nodes.iter().map(Node::to_proto).collect(),
            name: self.name.clone(),
            initializer: self.initializers.iter().map(Initializer::to_proto).collect(),
            doc_string: String::new(),
            input: self.inputs.iter().map(ValueInfo::to_proto).collect(),
            output: self.outputs.iter().map(ValueInfo::to_proto).collect(),
            value_info: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(width: usize) -> Graph {
        let mut g = Graph::new("a");
        g.inputs.push(ValueInfo::batch_matrix("a_in", ElemType::Float, 4));
        g.outputs.push(ValueInfo::batch_matrix("a_out", ElemType::Float, width));
        g.nodes.push(Node::new("a_node", "Identity", &["a_in"], &["a_out"]));
        g
    }

    fn consumer(width: usize) -> Graph {
        let mut g = Graph::new("b");
        g.inputs.push(ValueInfo::batch_matrix("b_in", ElemType::Float, width));
        g.outputs.push(ValueInfo::batch_vector("b_out", ElemType::Int64));
        g.outputs.push(ValueInfo {
            name: "b_seq".to_string(),
            ty: ValueType::SequenceOfMaps {
                key: ElemType::Int64,
                value: ElemType::Float,
            },
        });
        g.nodes.push(Node::new("b_node", "ArgMax", &["b_in"], &["b_out"]));
        g.nodes.push(Node::new("b_zip", "ZipMap", &["b_in"], &["b_seq"]));
        g.initializers.push(Initializer {
            name: "unused".to_string(),
            dims: vec![1],
            data: vec![0.0],
        });
        g
    }

    #[test]
    fn test_merge_connects_and_renames() {
        let merged = Graph::merge(producer(4), consumer(4), &[("a_out", "b_in")]).unwrap();
        assert_eq!(merged.inputs.len(), 1);
        assert_eq!(merged.inputs[0].name, "a_in");
        assert!(merged.output("a_out").is_none());
        assert_eq!(merged.nodes[1].inputs, vec!["a_out".to_string()]);
    }

    #[test]
    fn test_merge_rejects_width_mismatch() {
        let err = Graph::merge(producer(3), consumer(4), &[("a_out", "b_in")]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ExportShapeMismatch { producer_width: 3, consumer_width: 4, .. }
        ));
    }

    #[test]
    fn test_prune_removes_dead_nodes() {
        let mut merged = Graph::merge(producer(4), consumer(4), &[("a_out", "b_in")]).unwrap();
        merged.prune_outputs(|v| v.is_sequence());

        assert_eq!(merged.outputs.len(), 1);
        let ops: Vec<&str> = merged.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Identity", "ArgMax"]);
        assert!(merged.initializers.is_empty());
    }
}
