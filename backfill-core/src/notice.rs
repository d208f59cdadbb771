use crate::types::{BackfillError, ErrorNotice};

/// Codes the terminal emits as status chatter (farm connection OK, market data
/// farm inactive, and similar). They never fail a call.
pub const INFORMATIONAL_CODES: &[i32] = &[1102, 2104, 2106, 2107, 2108, 2119, 2158];

/// Codes meaning the connection itself is gone or unusable.
pub const CONNECTIVITY_CODES: &[i32] = &[502, 504, 1100, 1300];

/// Historical data service error; the message says which kind.
const HISTORICAL_SERVICE_CODE: i32 = 162;

/// Coarse notice category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeClass {
    /// Status chatter; ignore.
    Informational,
    /// The link lost its connection.
    Connectivity,
    /// The call was answered but produced no usable data.
    Data,
}

/// Returns true for codes on the informational allow-list.
#[must_use]
pub fn is_informational(code: i32) -> bool {
    INFORMATIONAL_CODES.contains(&code)
}

/// Classify a notice by code.
#[must_use]
pub fn classify(code: i32) -> NoticeClass {
    if is_informational(code) {
        NoticeClass::Informational
    } else if CONNECTIVITY_CODES.contains(&code) {
        NoticeClass::Connectivity
    } else {
        NoticeClass::Data
    }
}

/// Map a single notice to the error it represents, or `None` when informational.
#[must_use]
pub fn to_error(notice: &ErrorNotice) -> Option<BackfillError> {
    match classify(notice.code) {
        NoticeClass::Informational => None,
        NoticeClass::Connectivity => Some(BackfillError::connection(format!(
            "{} (code {})",
            notice.message, notice.code
        ))),
        NoticeClass::Data if notice.code == HISTORICAL_SERVICE_CODE => {
            let lower = notice.message.to_ascii_lowercase();
            if lower.contains("pacing violation") {
                Some(BackfillError::PacingViolation { reset_in_ms: 0 })
            } else if lower.contains("no data") {
                Some(BackfillError::data(notice.message.clone()))
            } else {
                Some(BackfillError::remote(notice.code, notice.message.clone()))
            }
        }
        NoticeClass::Data => Some(BackfillError::remote(notice.code, notice.message.clone())),
    }
}

/// First true error among `notices`, skipping informational ones.
///
/// Connectivity notices take precedence over data notices so a dropped link is
/// never reported as a mere data problem.
#[must_use]
pub fn first_error(notices: &[ErrorNotice]) -> Option<BackfillError> {
    notices
        .iter()
        .find(|n| classify(n.code) == NoticeClass::Connectivity)
        .or_else(|| notices.iter().find(|n| !is_informational(n.code)))
        .and_then(to_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn notice(code: i32, msg: &str) -> ErrorNotice {
        ErrorNotice::new(code, msg, Utc::now())
    }

    #[test]
    fn farm_status_is_ignored() {
        let notices = vec![
            notice(2104, "Market data farm connection is OK:usfarm"),
            notice(2106, "HMDS data farm connection is OK:ushmds"),
            notice(2158, "Sec-def data farm connection is OK:secdefil"),
        ];
        assert!(first_error(&notices).is_none());
    }

    #[test]
    fn connectivity_wins_over_data() {
        let notices = vec![
            notice(2104, "ok"),
            notice(200, "No security definition has been found"),
            notice(1100, "Connectivity between IB and TWS has been lost."),
        ];
        let err = first_error(&notices).unwrap();
        assert!(err.is_connectivity());
    }

    #[test]
    fn historical_service_messages_are_split() {
        let pacing = to_error(&notice(
            162,
            "Historical Market Data Service error message:Historical data request pacing violation",
        ));
        assert_eq!(pacing, Some(BackfillError::PacingViolation { reset_in_ms: 0 }));

        let empty = to_error(&notice(
            162,
            "Historical Market Data Service error message:HMDS query returned no data",
        ));
        assert!(matches!(empty, Some(BackfillError::Data(_))));
    }

    #[test]
    fn unknown_codes_surface_as_remote_notices() {
        let err = to_error(&notice(321, "Error validating request")).unwrap();
        assert_eq!(
            err,
            BackfillError::RemoteNotice {
                code: 321,
                message: "Error validating request".into()
            }
        );
    }
}
