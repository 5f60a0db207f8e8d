use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;

use crate::config::AccessPointCredentials;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedAccessPoint {
    pub ssid: String,
    pub rssi: i8,
}

pub trait Network {
    /// Radio bring-up, run once per wake before the first poll. A failure is
    /// not fatal: polling still runs up to the attempt threshold.
    fn start_association(&mut self) -> bool {
        true
    }

    // Called once per poll; must not block for long.
    fn poll_association(&mut self) -> bool;

    fn sync_clock(&mut self, servers: &[String], posix_tz: &str) -> bool;

    fn now(&self) -> Option<DateTime<Utc>>;
}

/// Strongest visible known AP, else the first configured one.
pub fn select_access_point<'a>(
    known: &'a [AccessPointCredentials],
    scanned: &[ScannedAccessPoint],
) -> Option<&'a AccessPointCredentials> {
    let visible = known
        .iter()
        .filter_map(|ap| {
            scanned
                .iter()
                .filter(|seen| seen.ssid == ap.ssid)
                .map(|seen| seen.rssi)
                .max()
                .map(|rssi| (ap, rssi))
        })
        // max_by_key keeps the last maximum; reverse so config order breaks ties.
        .rev()
        .max_by_key(|(_, rssi)| *rssi)
        .map(|(ap, _)| ap);

    visible.or_else(|| known.first())
}

pub fn now_in_timezone(timezone: &str, now: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = now.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ap(ssid: &str) -> AccessPointCredentials {
        AccessPointCredentials {
            ssid: ssid.to_string(),
            password: "pw".to_string(),
        }
    }

    fn seen(ssid: &str, rssi: i8) -> ScannedAccessPoint {
        ScannedAccessPoint {
            ssid: ssid.to_string(),
            rssi,
        }
    }

    #[test]
    fn strongest_known_access_point_wins() {
        let known = [ap("home"), ap("garage"), ap("office")];
        let scanned = [seen("neighbour", -30), seen("home", -80), seen("garage", -55)];

        let chosen = select_access_point(&known, &scanned).unwrap();
        assert_eq!(chosen.ssid, "garage");
    }

    #[test]
    fn equal_signal_prefers_config_order() {
        let known = [ap("home"), ap("garage")];
        let scanned = [seen("garage", -60), seen("home", -60)];

        assert_eq!(select_access_point(&known, &scanned).unwrap().ssid, "home");
    }

    #[test]
    fn falls_back_to_first_configured() {
        let known = [ap("home"), ap("garage")];
        assert_eq!(select_access_point(&known, &[]).unwrap().ssid, "home");
        assert_eq!(select_access_point(&[], &[seen("home", -40)]), None);
    }

    #[test]
    fn renders_bangkok_local_time() {
        let now = Utc.with_ymd_and_hms(2022, 4, 3, 17, 30, 0).unwrap();
        let local = now_in_timezone("Asia/Bangkok", now).unwrap();
        assert_eq!(local.offset().local_minus_utc(), 7 * 3600);
        assert_eq!(local.to_rfc3339(), "2022-04-04T00:30:00+07:00");
        assert!(now_in_timezone("Not/AZone", now).is_none());
    }
}
