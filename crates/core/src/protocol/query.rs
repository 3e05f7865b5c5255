//! SAT>IP query-string parsing.
//!
//! Tuning parameters ride in the Request-URI:
//!
//! ```text
//! rtsp://host:554/?msys=dvbs&freq=11720&pol=v&sr=27500&fec=34&pids=0,17,100
//! ```
//!
//! This module only tokenizes and types the values; mapping to frontend
//! configuration lives with the delivery systems.

use crate::error::{ParseErrorKind, Result, SatipError};
use crate::mpegts::pid_table::ALL_PIDS;

/// A full PID-set request (`pids=`), as opposed to a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidSelection {
    /// `pids=all` — the whole transport stream.
    All,
    /// `pids=none` — clear everything.
    None,
    /// Explicit list, each in `0..=8192`.
    List(Vec<u16>),
}

/// Parsed query parameters of one request, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct SatipQuery {
    params: Vec<(String, String)>,
}

impl SatipQuery {
    /// Extract and tokenize the query string of a request URI. A URI
    /// without `?` yields an empty query.
    pub fn from_uri(uri: &str) -> Self {
        let Some((_, query)) = uri.split_once('?') else {
            return Self::default();
        };
        let params = query
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (k.to_ascii_lowercase(), v.to_string()),
                None => (part.to_ascii_lowercase(), String::new()),
            })
            .collect();
        SatipQuery { params }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Delivery system name (`msys=`), lowercase.
    pub fn msys(&self) -> Option<&str> {
        self.get("msys")
    }

    /// `freq=` in MHz with optional fraction, returned in kHz
    /// (11720.5 MHz → 11 720 500 kHz).
    pub fn frequency_khz(&self) -> Option<Result<u32>> {
        let value = self.get("freq")?;
        Some(
            value
                .parse::<f64>()
                .ok()
                .filter(|mhz| *mhz > 0.0 && *mhz < 4_000_000.0)
                .map(|mhz| (mhz * 1000.0).round() as u32)
                .ok_or_else(|| SatipError::Parse {
                    kind: ParseErrorKind::InvalidQuery("freq".to_string()),
                }),
        )
    }

    /// Any integer parameter (`sr=`, `src=`, `t2id=`, …).
    pub fn int(&self, key: &str) -> Option<Result<u32>> {
        let value = self.get(key)?;
        Some(value.parse::<u32>().map_err(|_| SatipError::Parse {
            kind: ParseErrorKind::InvalidQuery(key.to_string()),
        }))
    }

    /// Full PID-set replacement (`pids=`).
    pub fn pids(&self) -> Option<Result<PidSelection>> {
        let value = self.get("pids")?;
        Some(match value {
            "all" => Ok(PidSelection::All),
            "none" => Ok(PidSelection::None),
            list => parse_pid_list(list, "pids").map(PidSelection::List),
        })
    }

    /// PIDs to merge into the current set (`addpids=`).
    pub fn addpids(&self) -> Option<Result<Vec<u16>>> {
        self.get("addpids").map(|v| parse_pid_list(v, "addpids"))
    }

    /// PIDs to remove from the current set (`delpids=`).
    pub fn delpids(&self) -> Option<Result<Vec<u16>>> {
        self.get("delpids").map(|v| parse_pid_list(v, "delpids"))
    }

    /// Whether this request carries any tuning parameter at all.
    pub fn has_tuning_parameters(&self) -> bool {
        self.params.iter().any(|(k, _)| {
            matches!(
                k.as_str(),
                "msys" | "freq" | "pol" | "sr" | "fec" | "mtype" | "ro" | "plts" | "src" | "bw"
                    | "tmode" | "gi" | "uri"
            )
        })
    }
}

fn parse_pid_list(list: &str, param: &str) -> Result<Vec<u16>> {
    list.split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<u16>()
                .ok()
                .filter(|pid| *pid <= ALL_PIDS)
                .ok_or_else(|| SatipError::Parse {
                    kind: ParseErrorKind::InvalidQuery(param.to_string()),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_query() {
        let q = SatipQuery::from_uri("rtsp://h:554/?msys=dvbs&freq=11720&pol=v&sr=27500&fec=34");
        assert_eq!(q.msys(), Some("dvbs"));
        assert_eq!(q.get("pol"), Some("v"));
        assert_eq!(q.int("sr").unwrap().unwrap(), 27500);
    }

    #[test]
    fn no_query_is_empty() {
        assert!(SatipQuery::from_uri("rtsp://h:554/").is_empty());
        assert!(SatipQuery::from_uri("rtsp://h:554/stream=1").is_empty());
    }

    #[test]
    fn frequency_fractional_mhz_to_khz() {
        let q = SatipQuery::from_uri("rtsp://h/?freq=11720.5");
        assert_eq!(q.frequency_khz().unwrap().unwrap(), 11_720_500);
        let q = SatipQuery::from_uri("rtsp://h/?freq=714");
        assert_eq!(q.frequency_khz().unwrap().unwrap(), 714_000);
    }

    #[test]
    fn frequency_rejects_garbage() {
        let q = SatipQuery::from_uri("rtsp://h/?freq=banana");
        assert!(q.frequency_khz().unwrap().is_err());
    }

    #[test]
    fn pid_selection_literals() {
        let q = SatipQuery::from_uri("rtsp://h/?pids=all");
        assert_eq!(q.pids().unwrap().unwrap(), PidSelection::All);
        let q = SatipQuery::from_uri("rtsp://h/?pids=none");
        assert_eq!(q.pids().unwrap().unwrap(), PidSelection::None);
        let q = SatipQuery::from_uri("rtsp://h/?pids=0,17,100");
        assert_eq!(
            q.pids().unwrap().unwrap(),
            PidSelection::List(vec![0, 17, 100])
        );
    }

    #[test]
    fn pid_deltas() {
        let q = SatipQuery::from_uri("rtsp://h/?addpids=100&delpids=17");
        assert_eq!(q.addpids().unwrap().unwrap(), vec![100]);
        assert_eq!(q.delpids().unwrap().unwrap(), vec![17]);
    }

    #[test]
    fn pid_out_of_range_rejected() {
        let q = SatipQuery::from_uri("rtsp://h/?pids=0,8193");
        assert!(q.pids().unwrap().is_err());
    }

    #[test]
    fn tuning_parameter_detection() {
        assert!(SatipQuery::from_uri("rtsp://h/?freq=11720").has_tuning_parameters());
        assert!(!SatipQuery::from_uri("rtsp://h/?pids=0").has_tuning_parameters());
    }
}
