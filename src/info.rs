//! Parsing of `INFO` replies, shared by the prober (discovering replicas and
//! role changes) and the failover driver (watching for a promoted replica to
//! report `role:master`). Generalized from
//! `spineldb::core::warden::worker::parse_and_update_state`, which only
//! handled one hardcoded master's replication section.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedRole {
    Master,
    Slave,
}

#[derive(Debug, Clone)]
pub struct ReplicaAdvertisement {
    pub ip: String,
    pub port: u16,
    pub offset: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedInfo {
    pub run_id: Option<String>,
    pub role: Option<ReportedRole>,
    /// Present only when `role == Master`: every `slaveN:` advertisement.
    pub replicas: Vec<ReplicaAdvertisement>,
    /// Present only when `role == Slave`.
    pub master_host: Option<String>,
    pub master_port: Option<u16>,
    pub master_link_status_up: Option<bool>,
    pub master_link_down_since_seconds: Option<u64>,
    pub slave_priority: Option<u16>,
    pub slave_repl_offset: Option<u64>,
    pub replica_announced: Option<bool>,
}

/// Parses a line-oriented `INFO` reply. Unknown or malformed lines are
/// ignored; this never fails, matching `spec.md` §7's "callbacks localize
/// errors" stance for non-critical parsing.
pub fn parse_info(text: &str) -> ParsedInfo {
    let mut out = ParsedInfo::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once(':') else {
            continue;
        };
        match key {
            "run_id" | "master_replid" => out.run_id = Some(val.to_string()),
            "role" => {
                out.role = match val {
                    "master" => Some(ReportedRole::Master),
                    "slave" => Some(ReportedRole::Slave),
                    _ => None,
                };
            }
            "master_host" => out.master_host = Some(val.to_string()),
            "master_port" => out.master_port = val.parse().ok(),
            "master_link_status" => out.master_link_status_up = Some(val == "up"),
            "master_link_down_since_seconds" => out.master_link_down_since_seconds = val.parse().ok(),
            "slave_priority" => out.slave_priority = val.parse().ok(),
            "slave_repl_offset" => out.slave_repl_offset = val.parse().ok(),
            "replica_announced" => out.replica_announced = Some(val != "0"),
            k if k.starts_with("slave") && k.chars().skip(5).all(|c| c.is_ascii_digit()) => {
                let fields: HashMap<&str, &str> = val.split(',').filter_map(|p| p.split_once('=')).collect();
                if let (Some(ip), Some(port)) = (fields.get("ip"), fields.get("port"))
                    && let Ok(port) = port.parse::<u16>()
                {
                    let offset = fields.get("offset").and_then(|s| s.parse().ok()).unwrap_or(0);
                    out.replicas.push(ReplicaAdvertisement {
                        ip: ip.to_string(),
                        port,
                        offset,
                    });
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_master_with_one_replica() {
        let text = "role:master\nrun_id:abc123\nslave0:ip=127.0.0.1,port=6380,state=online,offset=42\n";
        let parsed = parse_info(text);
        assert_eq!(parsed.role, Some(ReportedRole::Master));
        assert_eq!(parsed.run_id.as_deref(), Some("abc123"));
        assert_eq!(parsed.replicas.len(), 1);
        assert_eq!(parsed.replicas[0].port, 6380);
        assert_eq!(parsed.replicas[0].offset, 42);
    }

    #[test]
    fn parses_slave_fields() {
        let text = "role:slave\nmaster_host:10.0.0.1\nmaster_port:6379\nmaster_link_status:down\nslave_priority:50\n";
        let parsed = parse_info(text);
        assert_eq!(parsed.role, Some(ReportedRole::Slave));
        assert_eq!(parsed.master_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(parsed.master_link_status_up, Some(false));
        assert_eq!(parsed.slave_priority, Some(50));
    }
}
