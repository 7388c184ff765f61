//! Provider action → change type classification
//!
//! Rules are prefix matches evaluated in order; the first hit wins and
//! anything unmatched is drift.

use crate::monitoring::ChangeType;

/// Ordered prefix rules
pub type Rules = &'static [(&'static str, ChangeType)];

/// API action names (AWS CloudTrail `eventName`, GCP `eventType`)
pub const ACTION_RULES: Rules = &[
    ("Create", ChangeType::Create),
    ("Put", ChangeType::Create),
    ("Update", ChangeType::Update),
    ("Modify", ChangeType::Update),
    ("Delete", ChangeType::Delete),
    ("Remove", ChangeType::Delete),
];

/// Azure Event Grid event types
pub const AZURE_RULES: Rules = &[
    ("Microsoft.Resources.ResourceWrite", ChangeType::Update),
    ("Microsoft.Resources.ResourceDelete", ChangeType::Delete),
    ("Created", ChangeType::Create),
    ("Updated", ChangeType::Update),
    ("Deleted", ChangeType::Delete),
];

pub fn classify(rules: Rules, action: &str) -> ChangeType {
    rules
        .iter()
        .find(|(prefix, _)| action.starts_with(prefix))
        .map(|(_, change_type)| *change_type)
        .unwrap_or(ChangeType::Drift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_rules() {
        let cases = [
            ("CreateBucket", ChangeType::Create),
            ("PutBucketPolicy", ChangeType::Create),
            ("UpdateFunctionConfiguration", ChangeType::Update),
            ("ModifyDBInstance", ChangeType::Update),
            ("DeleteSecurityGroup", ChangeType::Delete),
            ("RemoveTags", ChangeType::Delete),
            ("RunInstances", ChangeType::Drift),
            ("", ChangeType::Drift),
        ];

        for (action, expected) in cases {
            assert_eq!(classify(ACTION_RULES, action), expected, "action {action}");
        }
    }

    #[test]
    fn test_prefix_not_substring() {
        assert_eq!(classify(ACTION_RULES, "BatchDeleteItems"), ChangeType::Drift);
        assert_eq!(classify(AZURE_RULES, "ResourceDeleted"), ChangeType::Drift);
    }

    #[test]
    fn test_azure_rules() {
        assert_eq!(
            classify(AZURE_RULES, "Microsoft.Resources.ResourceWriteSuccess"),
            ChangeType::Update
        );
        assert_eq!(
            classify(AZURE_RULES, "Microsoft.Resources.ResourceDeleteSuccess"),
            ChangeType::Delete
        );
        assert_eq!(classify(AZURE_RULES, "CreatedByPolicy"), ChangeType::Create);
        assert_eq!(
            classify(AZURE_RULES, "Microsoft.Storage.BlobCreated"),
            ChangeType::Drift
        );
    }
}
