use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a criterion gets verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    #[default]
    UnitTest,
    IntegrationTest,
    Browser,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    #[default]
    Pending,
    Met,
    NotMet,
    Blocked,
}

impl std::str::FromStr for CriterionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "met" => Ok(Self::Met),
            "not_met" => Ok(Self::NotMet),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown criterion status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub verification_method: VerificationMethod,
    #[serde(default)]
    pub status: CriterionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

impl AcceptanceCriterion {
    pub fn new(id: &str, description: &str, method: VerificationMethod) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            verification_method: method,
            status: CriterionStatus::Pending,
            notes: None,
            verified_at: None,
        }
    }
}

/// Per-status counts, always derived from the items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriteriaSummary {
    pub total: usize,
    pub pending: usize,
    pub met: usize,
    pub not_met: usize,
    pub blocked: usize,
}

impl CriteriaSummary {
    fn from_items(items: &[AcceptanceCriterion]) -> Self {
        let mut summary = Self {
            total: items.len(),
            ..Self::default()
        };
        for item in items {
            match item.status {
                CriterionStatus::Pending => summary.pending += 1,
                CriterionStatus::Met => summary.met += 1,
                CriterionStatus::NotMet => summary.not_met += 1,
                CriterionStatus::Blocked => summary.blocked += 1,
            }
        }
        summary
    }
}

/// An issue's acceptance criteria and their derived summary.
///
/// Items are only reachable through methods that recompute the summary,
/// so the two never drift apart. Deserialization recomputes it as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CriteriaDocument")]
pub struct AcceptanceCriteria {
    items: Vec<AcceptanceCriterion>,
    summary: CriteriaSummary,
}

#[derive(Deserialize)]
struct CriteriaDocument {
    #[serde(default)]
    items: Vec<AcceptanceCriterion>,
}

impl From<CriteriaDocument> for AcceptanceCriteria {
    fn from(doc: CriteriaDocument) -> Self {
        Self::new(doc.items)
    }
}

impl AcceptanceCriteria {
    pub fn new(items: Vec<AcceptanceCriterion>) -> Self {
        let summary = CriteriaSummary::from_items(&items);
        Self { items, summary }
    }

    pub fn items(&self) -> &[AcceptanceCriterion] {
        &self.items
    }

    pub fn summary(&self) -> CriteriaSummary {
        self.summary
    }

    pub fn get(&self, id: &str) -> Option<&AcceptanceCriterion> {
        self.items.iter().find(|c| c.id == id)
    }

    /// Update one criterion's status. Returns false when `id` is unknown.
    ///
    /// `verified_at` is stamped whenever the outcome becomes met or not met.
    pub fn update_status(
        &mut self,
        id: &str,
        status: CriterionStatus,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(item) = self.items.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        item.status = status;
        if notes.is_some() {
            item.notes = notes;
        }
        if matches!(status, CriterionStatus::Met | CriterionStatus::NotMet) {
            item.verified_at = Some(now);
        }
        self.summary = CriteriaSummary::from_items(&self.items);
        true
    }

    pub fn all_met(&self) -> bool {
        !self.items.is_empty() && self.summary.met == self.summary.total
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.id.trim().is_empty() {
                return Err("acceptance criterion with empty id".to_string());
            }
            if !seen.insert(item.id.as_str()) {
                return Err(format!("duplicate acceptance criterion id '{}'", item.id));
            }
        }
        Ok(())
    }
}
