use serde::{Deserialize, Serialize};

use super::management::SystemInformation;

/// 针对通道能力描述求值的布尔谓词树
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionPolicy {
    Always,
    Equal { property: String, value: String },
    Contains { property: String, value: String },
    AtLeast { property: String, value: f64 },
    AtMost { property: String, value: f64 },
    OneOf { property: String, values: Vec<String> },
    And { policies: Vec<ExecutionPolicy> },
    Or { policies: Vec<ExecutionPolicy> },
    Not { policy: Box<ExecutionPolicy> },
}

impl ExecutionPolicy {
    pub fn equal(property: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equal {
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn at_least(property: impl Into<String>, value: f64) -> Self {
        Self::AtLeast {
            property: property.into(),
            value,
        }
    }

    pub fn at_most(property: impl Into<String>, value: f64) -> Self {
        Self::AtMost {
            property: property.into(),
            value,
        }
    }

    pub fn and(self, other: ExecutionPolicy) -> Self {
        Self::And {
            policies: vec![self, other],
        }
    }

    pub fn or(self, other: ExecutionPolicy) -> Self {
        Self::Or {
            policies: vec![self, other],
        }
    }

    pub fn negate(self) -> Self {
        Self::Not {
            policy: Box::new(self),
        }
    }

    /// 缺失的属性永远不匹配
    pub fn accepts(&self, info: &SystemInformation) -> bool {
        match self {
            ExecutionPolicy::Always => true,
            ExecutionPolicy::Equal { property, value } => {
                info.get(property).is_some_and(|v| v == value)
            }
            ExecutionPolicy::Contains { property, value } => {
                info.get(property).is_some_and(|v| v.contains(value.as_str()))
            }
            ExecutionPolicy::AtLeast { property, value } => {
                numeric(info, property).is_some_and(|v| v >= *value)
            }
            ExecutionPolicy::AtMost { property, value } => {
                numeric(info, property).is_some_and(|v| v <= *value)
            }
            ExecutionPolicy::OneOf { property, values } => info
                .get(property)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            ExecutionPolicy::And { policies } => policies.iter().all(|p| p.accepts(info)),
            ExecutionPolicy::Or { policies } => policies.iter().any(|p| p.accepts(info)),
            ExecutionPolicy::Not { policy } => !policy.accepts(info),
        }
    }
}

fn numeric(info: &SystemInformation, property: &str) -> Option<f64> {
    info.get(property).and_then(|v| v.trim().parse::<f64>().ok())
}
