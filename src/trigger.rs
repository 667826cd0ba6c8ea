use crate::types::{ConversionRecord, ConversionStatus, PostbackTask};

/// Whether a conversion warrants a postback.
///
/// Only terminal outcomes are reported: approved, declined, refunded and
/// chargeback. Everything else is ignored without a trace.
pub fn should_trigger(record: &ConversionRecord) -> bool {
    matches!(
        record.conversion_status,
        ConversionStatus::Approved
            | ConversionStatus::Declined
            | ConversionStatus::Refunded
            | ConversionStatus::Chargeback
    )
}

/// Project a conversion onto the delivery task.
///
/// No validation happens here; a malformed record surfaces later as a
/// delivery failure.
pub fn build_task(record: &ConversionRecord) -> PostbackTask {
    PostbackTask {
        conversion_id: record.id.clone(),
        advertiser_id: record.advertiser_id.clone(),
        partner_id: record.partner_id.clone(),
        campaign_id: record.campaign_id.clone(),
        offer_id: record.offer_id.clone(),
        flow_id: record.flow_id.clone(),
        click_id: record.click_id.clone(),
        conversion_type: record.conversion_type,
        external_tx_id: record.external_tx_id.clone(),
        conversion_status: record.conversion_status.clone(),
        revenue: record.revenue.clone(),
        currency: record.currency.clone(),
        antifraud_level: record
            .antifraud_level
            .clone()
            .unwrap_or_else(|| "ok".to_string()),
    }
}

/// Filter and project in one step.
pub fn task_for(record: &ConversionRecord) -> Option<PostbackTask> {
    should_trigger(record).then(|| build_task(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversionType;

    fn record(status: &str) -> ConversionRecord {
        ConversionRecord::new("c1", "adv", "clk1", ConversionType::Purchase, status)
    }

    #[test]
    fn terminal_statuses_produce_exactly_one_task() {
        for status in ["approved", "declined", "refunded", "chargeback"] {
            assert!(task_for(&record(status)).is_some(), "{status}");
        }
    }

    #[test]
    fn other_statuses_are_ignored() {
        for status in ["pending", "hold", "trash", ""] {
            assert!(task_for(&record(status)).is_none(), "{status}");
        }
    }

    #[test]
    fn antifraud_level_defaults_to_ok() {
        let task = build_task(&record("approved"));
        assert_eq!(task.antifraud_level, "ok");

        let task = build_task(&record("approved").with_antifraud_level("suspicious"));
        assert_eq!(task.antifraud_level, "suspicious");
    }
}
