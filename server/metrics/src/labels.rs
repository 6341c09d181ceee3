//! Label hygiene. Every label value on an exported counter must come from
//! a fixed set, otherwise a hostile or buggy caller could mint unbounded
//! time series on the scrape endpoint.

/// Drop reasons allowed on the `*_drops_total` counters.
const DROP_REASONS: &[&str] = &[
    "invalid_frame",
    "invalid_config",
    "unknown_peer",
    "bad_tag",
    "ts2",
    "ingress_rule",
    "address_mismatch",
    "unroutable",
];

/// Returns the reason unchanged when it is in the allowed set, and folds
/// everything else into "other".
pub fn drop_reason(reason: &'static str) -> &'static str {
    if DROP_REASONS.contains(&reason) {
        reason
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_reasons_pass_through() {
        assert_eq!(drop_reason("bad_tag"), "bad_tag");
        assert_eq!(drop_reason("ts2"), "ts2");
    }

    #[test]
    fn unknown_reasons_fold_to_other() {
        assert_eq!(drop_reason("weird_new_case"), "other");
        assert_eq!(drop_reason(""), "other");
    }
}
