//! Native tree-ensemble model.
//!
//! The training side exports its fitted forest as JSON: one node array per
//! tree, split nodes pointing at their children by index, leaves carrying the
//! per-class distribution. Prediction follows the usual random-forest rule:
//! each tree's leaf distribution is normalised, the distributions are
//! averaged, and the most probable class wins.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{DecisionModel, Label};
use crate::error::{DetectorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: Vec<f64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn leaf(&self, features: &[f64]) -> &[f64] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if features[*feature] <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { value } => return value,
            }
        }
    }

    fn validate(&self, tree: usize, n_features: usize, n_classes: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(invalid(format!("tree {} has no nodes", tree)));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    threshold,
                } => {
                    if *feature >= n_features {
                        return Err(invalid(format!(
                            "tree {} node {} splits on feature {} but the model has {}",
                            tree, i, feature, n_features
                        )));
                    }
                    // Children always come after their parent, which rules out cycles
                    for child in [*left, *right] {
                        if child <= i || child >= self.nodes.len() {
                            return Err(invalid(format!(
                                "tree {} node {} has out-of-order child {}",
                                tree, i, child
                            )));
                        }
                    }
                    if threshold.is_nan() {
                        return Err(invalid(format!("tree {} node {} has a NaN threshold", tree, i)));
                    }
                }
                TreeNode::Leaf { value } => {
                    if value.len() != n_classes {
                        return Err(invalid(format!(
                            "tree {} leaf {} has {} class weights, expected {}",
                            tree,
                            i,
                            value.len(),
                            n_classes
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsemble {
    #[serde(default = "default_kind")]
    pub kind: String,
    pub n_features: usize,
    pub classes: Vec<i64>,
    pub trees: Vec<DecisionTree>,
    /// Attack-class prior recorded at training time.
    #[serde(default)]
    pub base_value: Option<f64>,
}

fn default_kind() -> String {
    "random_forest".to_string()
}

fn invalid(msg: String) -> DetectorError {
    DetectorError::ArtifactLoad(format!("invalid tree ensemble: {}", msg))
}

impl TreeEnsemble {
    pub fn from_json(json: &str) -> Result<Self> {
        let model: TreeEnsemble = serde_json::from_str(json)
            .map_err(|e| DetectorError::ArtifactLoad(format!("cannot parse model: {}", e)))?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            DetectorError::ArtifactLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trees.is_empty() {
            return Err(invalid("no trees".to_string()));
        }
        if self.classes.is_empty() {
            return Err(invalid("no classes".to_string()));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(i, self.n_features, self.classes.len())?;
        }
        Ok(())
    }

    fn check_len(&self, features: &[f64]) -> Result<()> {
        if features.len() != self.n_features {
            return Err(DetectorError::ModelInvocation {
                expected: self.n_features,
                actual: features.len(),
            });
        }
        Ok(())
    }

    /// Averaged class distribution for one row.
    pub fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>> {
        self.check_len(features)?;
        let mut totals = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            let leaf = tree.leaf(features);
            let sum: f64 = leaf.iter().sum();
            if sum > 0.0 {
                for (total, weight) in totals.iter_mut().zip(leaf) {
                    *total += weight / sum;
                }
            }
        }
        let n = self.trees.len() as f64;
        totals.iter_mut().for_each(|t| *t /= n);
        Ok(totals)
    }
}

impl DecisionModel for TreeEnsemble {
    fn n_features(&self) -> Option<usize> {
        Some(self.n_features)
    }

    fn predict(&self, features: &[f64]) -> Result<Label> {
        let proba = self.predict_proba(features)?;
        // First maximum wins, matching argmax
        let mut best = 0;
        for (i, p) in proba.iter().enumerate() {
            if *p > proba[best] {
                best = i;
            }
        }
        Ok(Label::from_class(self.classes[best]))
    }

    fn base_value(&self) -> Option<f64> {
        self.base_value
    }

    fn name(&self) -> &str {
        &self.kind
    }
}
