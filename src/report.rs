//! Typed shape of an evaluation result.
//!
//! The serialized field names, the five-to-nine rubric keys and the score
//! ranges are a compatibility surface: dashboards and the reporting exports
//! read these documents directly, so renames here are breaking changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Customer,
}

/// One utterance of the transcribed conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub turn: u32,
    pub text: String,
    pub speaker_role: Speaker,
}

/// The closed rubric-item set. Serialized labels are the Korean names the
/// scoring prompt produces and the dashboards key on; an unknown label in a
/// service response fails deserialization rather than widening the set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CriteriaKey {
    #[serde(rename = "지역")]
    Region,
    #[serde(rename = "방문일시")]
    VisitSchedule,
    #[serde(rename = "인사")]
    Greeting,
    #[serde(rename = "적극적 응대")]
    ActiveResponse,
    #[serde(rename = "적극적 세일즈")]
    ActiveSales,
    #[serde(rename = "용도 및 구매시기")]
    PurposeAndTiming,
    #[serde(rename = "문의 차량 확인")]
    VehicleInquiry,
    #[serde(rename = "결제방법")]
    PaymentMethod,
    #[serde(rename = "차량안내")]
    VehicleGuidance,
}

impl CriteriaKey {
    pub const ALL: [CriteriaKey; 9] = [
        Self::Region,
        Self::VisitSchedule,
        Self::Greeting,
        Self::ActiveResponse,
        Self::ActiveSales,
        Self::PurposeAndTiming,
        Self::VehicleInquiry,
        Self::PaymentMethod,
        Self::VehicleGuidance,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Region => "지역",
            Self::VisitSchedule => "방문일시",
            Self::Greeting => "인사",
            Self::ActiveResponse => "적극적 응대",
            Self::ActiveSales => "적극적 세일즈",
            Self::PurposeAndTiming => "용도 및 구매시기",
            Self::VehicleInquiry => "문의 차량 확인",
            Self::PaymentMethod => "결제방법",
            Self::VehicleGuidance => "차량안내",
        }
    }
}

/// Per-rubric-item detail. `evidence` quotes must come verbatim from the
/// transcript so the dashboard can highlight them in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriteriaDetail {
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<String>>,
}

/// A full evaluation result for one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub overall_score: u8,
    #[serde(default)]
    pub conversation_list: Vec<ConversationTurn>,
    pub summary: String,
    #[serde(default)]
    pub keyword: Vec<String>,
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub criteria: BTreeMap<CriteriaKey, CriteriaDetail>,
}

impl Report {
    /// Checks the constraints serde cannot express: score ranges and the
    /// evidence-traceability invariant (every quote appears in some turn's
    /// text). A report failing this counts as a failed evaluation attempt.
    pub fn validate(&self) -> Result<(), String> {
        if self.overall_score > 100 {
            return Err(format!(
                "overall_score {} out of range 0-100",
                self.overall_score
            ));
        }
        for (key, detail) in &self.criteria {
            if detail.score > 100 {
                return Err(format!(
                    "criteria '{}' score {} out of range 0-100",
                    key.label(),
                    detail.score
                ));
            }
            let Some(evidence) = &detail.evidence else {
                continue;
            };
            for quote in evidence {
                if quote.is_empty() {
                    continue;
                }
                let traceable = self
                    .conversation_list
                    .iter()
                    .any(|t| t.text.contains(quote.as_str()));
                if !traceable {
                    return Err(format!(
                        "criteria '{}' evidence not found in transcript: {}",
                        key.label(),
                        quote
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A fully-populated report for unit tests across the crate.
#[cfg(test)]
pub fn test_report(overall_score: u8) -> Report {
    let mut criteria = BTreeMap::new();
    criteria.insert(
        CriteriaKey::Greeting,
        CriteriaDetail {
            score: overall_score,
            description: Some("인사를 건넸습니다.".to_string()),
            improvement: None,
            evidence: Some(vec!["안녕하세요 중고차입니다".to_string()]),
        },
    );
    Report {
        overall_score,
        conversation_list: vec![
            ConversationTurn {
                turn: 0,
                text: "여보세요".to_string(),
                speaker_role: Speaker::Customer,
            },
            ConversationTurn {
                turn: 1,
                text: "네, 안녕하세요 중고차입니다.".to_string(),
                speaker_role: Speaker::Agent,
            },
        ],
        summary: "차량 구매 상담".to_string(),
        keyword: vec!["중고차".to_string(), "상담".to_string()],
        is_valid: true,
        feedback: None,
        criteria,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_round_trips_through_json() {
        let report = test_report(80);
        let json = serde_json::to_string(&report).unwrap();
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_criteria_keys_serialize_to_korean_labels() {
        let report = test_report(70);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"인사\""));
        assert!(!json.contains("Greeting"));
    }

    #[test]
    fn test_unknown_criteria_key_is_rejected() {
        let json = r#"{
            "overall_score": 50,
            "summary": "s",
            "is_valid": true,
            "criteria": {"새로운 기준": {"score": 10}}
        }"#;
        assert!(serde_json::from_str::<Report>(json).is_err());
    }

    #[test]
    fn test_validate_accepts_well_formed_report() {
        assert!(test_report(100).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_overall_score() {
        let mut report = test_report(80);
        report.overall_score = 101;
        let err = report.validate().unwrap_err();
        assert!(err.contains("overall_score"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_criteria_score() {
        let mut report = test_report(80);
        report
            .criteria
            .get_mut(&CriteriaKey::Greeting)
            .unwrap()
            .score = 120;
        let err = report.validate().unwrap_err();
        assert!(err.contains("인사"));
    }

    #[test]
    fn test_validate_rejects_untraceable_evidence() {
        let mut report = test_report(80);
        report
            .criteria
            .get_mut(&CriteriaKey::Greeting)
            .unwrap()
            .evidence = Some(vec!["통화에 없는 문장".to_string()]);
        let err = report.validate().unwrap_err();
        assert!(err.contains("evidence"));
    }

    #[test]
    fn test_validate_allows_missing_evidence() {
        let mut report = test_report(80);
        report
            .criteria
            .get_mut(&CriteriaKey::Greeting)
            .unwrap()
            .evidence = None;
        assert!(report.validate().is_ok());
    }

    #[test]
    fn test_all_labels_cover_every_key() {
        assert_eq!(CriteriaKey::ALL.len(), 9);
        for key in CriteriaKey::ALL {
            assert!(!key.label().is_empty());
        }
    }
}
