// Label tables and the model catalog
//
// Class ids emitted by each crop model index into the table for its crop kind.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const RICE_LABELS: &[&str] = &[
    "Brown_Spot（褐斑病）",
    "Rice_Blast（稻瘟病）",
    "Bacterial_Blight（细菌性叶枯病）",
];

const CORN_LABELS: &[&str] = &[
    "blight（疫病）",
    "common_rust（普通锈病）",
    "gray_spot（灰斑病）",
    "health（健康）",
];

const STRAWBERRY_LABELS: &[&str] = &[
    "Angular Leafspot（角斑病）",
    "Anthracnose Fruit Rot（炭疽果腐病）",
    "Blossom Blight（花枯病）",
    "Gray Mold（灰霉病）",
    "Leaf Spot（叶斑病）",
    "Powdery Mildew Fruit（白粉病果）",
    "Powdery Mildew Leaf（白粉病叶）",
];

const TOMATO_LABELS: &[&str] = &[
    "Early Blight（早疫病）",
    "Healthy（健康）",
    "Late Blight（晚疫病）",
    "Leaf Miner（潜叶病）",
    "Leaf Mold（叶霉病）",
    "Mosaic Virus（花叶病毒）",
    "Septoria（壳针孢属）",
    "Spider Mites（蜘蛛螨）",
    "Yellow Leaf Curl Virus（黄化卷叶病毒）",
];

/// Model artifact extension shipped in the weights directory.
pub const MODEL_EXTENSION: &str = "onnx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropKind {
    Corn,
    Rice,
    Strawberry,
    Tomato,
}

impl CropKind {
    pub const ALL: [CropKind; 4] = [
        CropKind::Corn,
        CropKind::Rice,
        CropKind::Strawberry,
        CropKind::Tomato,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CropKind::Corn => "corn",
            CropKind::Rice => "rice",
            CropKind::Strawberry => "strawberry",
            CropKind::Tomato => "tomato",
        }
    }

    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            CropKind::Corn => CORN_LABELS,
            CropKind::Rice => RICE_LABELS,
            CropKind::Strawberry => STRAWBERRY_LABELS,
            CropKind::Tomato => TOMATO_LABELS,
        }
    }

    /// Resolve a model class id to its human-readable name.
    pub fn label(&self, class_id: usize) -> Result<&'static str, ServiceError> {
        let table = self.labels();
        table
            .get(class_id)
            .copied()
            .ok_or(ServiceError::UnknownClass {
                id: class_id,
                kind: *self,
                len: table.len(),
            })
    }

    /// Default artifact name for this crop, e.g. `rice_best.onnx`.
    pub fn weight_file(&self) -> String {
        format!("{}_best.{}", self.as_str(), MODEL_EXTENSION)
    }

    /// Infer the crop kind from a weight file name such as `corn_best.onnx`.
    pub fn from_weight_name(name: &str) -> Option<Self> {
        let prefix = name.split(['_', '.', '-']).next()?;
        prefix.parse().ok()
    }
}

impl fmt::Display for CropKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CropKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        CropKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ServiceError::InvalidParam {
                name: "kind",
                reason: format!("unknown crop kind '{}'", s),
            })
    }
}

/// One entry of the model catalog served by `/file_names`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WeightItem {
    pub value: String,
    pub label: String,
}

pub fn weight_catalog() -> Vec<WeightItem> {
    CropKind::ALL
        .iter()
        .map(|kind| {
            let file = kind.weight_file();
            WeightItem {
                value: file.clone(),
                label: file,
            }
        })
        .collect()
}
