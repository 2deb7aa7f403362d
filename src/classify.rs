//! Maps probe outcomes onto result classifications.
use crate::probe::{ProbeError, ProbeOutcome, Verdict};
use crate::types::{Classification, ScanResult, Target};

/// Classification and reason text for a probe outcome.
pub fn classify(outcome: &ProbeOutcome) -> (Classification, String) {
    match outcome {
        Ok(Verdict::Safe) => (Classification::NotVulnerable, "SAFE".into()),
        Ok(Verdict::Vulnerable { .. }) => (Classification::Vulnerable, "VULNERABLE".into()),
        Err(ProbeError::TryAgain(_)) => {
            (Classification::Unknown, "UNKNOWN - PLEASE TRY AGAIN".into())
        }
        Err(ProbeError::Timeout) => {
            (Classification::Unknown, "UNKNOWN - CONNECTION TIMED OUT".into())
        }
        Err(ProbeError::ConnectionRefused) => (
            Classification::NotVulnerable,
            "NOT VULNERABLE - CONNECTION REFUSED".into(),
        ),
        Err(ProbeError::Other(detail)) => (Classification::Error, format!("ERROR - {detail}")),
    }
}

/// Build the result record for `target` from its probe outcome.
pub fn to_result(target: Target, outcome: &ProbeOutcome) -> ScanResult {
    let (classification, reason) = classify(outcome);
    ScanResult::new(target, classification, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;

    #[test]
    fn table() {
        let cases: Vec<(ProbeOutcome, Classification, &str)> = vec![
            (Ok(Verdict::Safe), Classification::NotVulnerable, "SAFE"),
            (
                Err(ProbeError::TryAgain("short read".into())),
                Classification::Unknown,
                "UNKNOWN - PLEASE TRY AGAIN",
            ),
            (
                Err(ProbeError::Timeout),
                Classification::Unknown,
                "UNKNOWN - CONNECTION TIMED OUT",
            ),
            (
                Err(ProbeError::ConnectionRefused),
                Classification::NotVulnerable,
                "NOT VULNERABLE - CONNECTION REFUSED",
            ),
            (
                Err(ProbeError::Other("no route to host".into())),
                Classification::Error,
                "ERROR - no route to host",
            ),
            (
                Ok(Verdict::Vulnerable { leaked: 16384 }),
                Classification::Vulnerable,
                "VULNERABLE",
            ),
        ];
        for (outcome, class, reason) in cases {
            assert_eq!(classify(&outcome), (class, reason.to_string()), "{outcome:?}");
        }
    }

    #[test]
    fn result_copies_target_fields() {
        let target = Target::new(Mode::Imap, "192.0.2.7", "143");
        let r = to_result(target, &Err(ProbeError::ConnectionRefused));
        assert_eq!(r.mode, Mode::Imap);
        assert_eq!(r.host, "192.0.2.7");
        assert_eq!(r.port, "143");
        assert_eq!(r.classification, Classification::NotVulnerable);
    }
}
