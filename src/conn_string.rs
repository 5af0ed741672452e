//! Connection-string parsing.
//!
//! Format: `Identifier,BrokerURL,User,Password,QoS,DeviceId[,MtuIn[,MtuOut]]`
//!
//! ```
//! use mgmt_mqtt::{parse_conn_string, Qos};
//!
//! let cfg = parse_conn_string("Client1,tcp://localhost:1883,,,0,3").unwrap();
//! assert_eq!(cfg.qos, Qos::AtMostOnce);
//! assert_eq!(cfg.rx_topic_path(), "Client1/update/3/server_rx");
//! ```

use std::str::FromStr;

use crate::{log_info, Error, Qos, Result, XportConfig};

const MIN_FIELDS: usize = 6;
const MAX_FIELDS: usize = 8;

/// Parse a connection string into a transport configuration.
///
/// Fields not carried by the string take [`XportConfig::default`] values.
/// Surrounding whitespace is stripped from every field except User and
/// Password, which are taken verbatim.
pub fn parse_conn_string(cs: &str) -> Result<XportConfig> {
    // ---
    let parts: Vec<&str> = cs.split(',').collect();

    if !(MIN_FIELDS..=MAX_FIELDS).contains(&parts.len()) {
        return Err(Error::FieldCount { found: parts.len() });
    }

    let mut cfg = XportConfig {
        id: parts[0].trim().to_string(),
        broker: parts[1].trim().to_string(),
        user: parts[2].to_string(),
        password: parts[3].to_string(),
        ..XportConfig::default()
    };

    let qos: i64 = parts[4]
        .trim()
        .parse()
        .map_err(|_| Error::InvalidQos(parts[4].to_string()))?;
    cfg.qos = Qos::try_from(qos)?;

    cfg.device_id = parts[5]
        .trim()
        .parse()
        .map_err(|_| Error::InvalidDeviceId(parts[5].to_string()))?;

    if let Some(mtu_in) = parts.get(6) {
        let mtu = parse_mtu(mtu_in)?;
        cfg.mtu_in = mtu;
        cfg.mtu_out = mtu;
    }
    if let Some(mtu_out) = parts.get(7) {
        cfg.mtu_out = parse_mtu(mtu_out)?;
    }

    log_info!(
        "mqtt id '{}'; broker '{}'; user '{}'; qos '{}'; device id '{}'; mtu in/out {}/{}",
        cfg.id,
        cfg.broker,
        cfg.user,
        cfg.qos,
        cfg.device_id,
        cfg.mtu_in,
        cfg.mtu_out
    );

    Ok(cfg)
}

fn parse_mtu(field: &str) -> Result<usize> {
    match field.trim().parse::<usize>() {
        Ok(mtu) if mtu > 0 => Ok(mtu),
        _ => Err(Error::InvalidMtu(field.to_string())),
    }
}

impl FromStr for XportConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_conn_string(s)
    }
}
