use crate::config::WolConf;
use crate::models::Device;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum WolError {
    #[error("device {0} has no MAC address configured")]
    MissingMac(String),
    #[error("invalid mac address: {0}")]
    InvalidMac(String),
    #[error("wake command failed: {0}")]
    Command(String),
    #[error("udp error: {0}")]
    Io(#[from] std::io::Error),
}

fn parse_mac(mac: &str) -> Result<[u8; 6], WolError> {
    let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return Err(WolError::InvalidMac(mac.to_string()));
    }
    let mut out = [0u8; 6];
    for i in 0..6 {
        out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| WolError::InvalidMac(mac.to_string()))?;
    }
    Ok(out)
}

fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0u8; 102];
    // 6 x 0xFF
    for byte in pkt.iter_mut().take(6) {
        *byte = 0xFF;
    }
    // 16 fois l'adresse MAC
    for i in 0..16 {
        let base = 6 + i * 6;
        pkt[base..base + 6].copy_from_slice(&mac);
    }
    pkt
}

/// Envoie le magic packet en UDP broadcast (ports 9 et 7), plus un envoi
/// unicast quand l'adresse de l'appareil est une IPv4 connue.
pub async fn wake_device(device: &Device, conf: Option<&WolConf>) -> Result<(), WolError> {
    // Commande opérateur prioritaire si configurée (ex: relai hors VLAN).
    if let Some(conf) = conf {
        return wake_with_command(device, conf).await;
    }

    let mac_str = device
        .mac
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| WolError::MissingMac(device.id.clone()))?;
    let pkt = magic_packet(parse_mac(mac_str)?);

    let sock = UdpSocket::bind(("0.0.0.0", 0))?;
    sock.set_broadcast(true)?;

    let mut targets: Vec<SocketAddrV4> = vec![
        SocketAddrV4::new(Ipv4Addr::BROADCAST, 9),
        SocketAddrV4::new(Ipv4Addr::BROADCAST, 7),
    ];
    if let Some(ip) = device.address.as_deref().and_then(|a| a.parse::<Ipv4Addr>().ok()) {
        targets.push(SocketAddrV4::new(ip, 9));
    }

    let mut ok = false;
    for addr in targets {
        match sock.send_to(&pkt, addr) {
            Ok(_) => ok = true,
            Err(e) => warn!("WOL send error to {addr}: {e}"),
        }
    }

    if ok {
        debug!("magic packet sent for {} ({mac_str})", device.name);
        Ok(())
    } else {
        Err(WolError::Command("no wol target reachable".into()))
    }
}

async fn wake_with_command(device: &Device, conf: &WolConf) -> Result<(), WolError> {
    let rendered = conf
        .command
        .replace("{id}", &device.id)
        .replace("{mac}", device.mac.as_deref().unwrap_or_default())
        .replace("{address}", device.address.as_deref().unwrap_or_default());

    let parts = shell_words::split(&rendered).map_err(|e| WolError::Command(e.to_string()))?;
    let Some((program, args)) = parts.split_first() else {
        return Err(WolError::Command("empty wake command".into()));
    };

    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| WolError::Command(e.to_string()))?;

    if status.success() {
        debug!("wake command succeeded for {}", device.name);
        Ok(())
    } else {
        Err(WolError::Command(format!("wake command exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing_accepts_common_formats() {
        let expected = [0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6];
        assert_eq!(parse_mac("a1:b2:c3:d4:e5:f6").unwrap(), expected);
        assert_eq!(parse_mac("A1-B2-C3-D4-E5-F6").unwrap(), expected);
        assert_eq!(parse_mac("a1b2c3d4e5f6").unwrap(), expected);
        assert!(parse_mac("a1:b2:c3").is_err());
        assert!(parse_mac("zz:zz:zz:zz:zz:zz").is_err());
    }

    #[test]
    fn magic_packet_is_six_ff_then_sixteen_macs() {
        let mac = [1, 2, 3, 4, 5, 6];
        let pkt = magic_packet(mac);
        assert_eq!(pkt.len(), 102);
        assert!(pkt[..6].iter().all(|&b| b == 0xFF));
        for i in 0..16 {
            let base = 6 + i * 6;
            assert_eq!(&pkt[base..base + 6], &mac);
        }
    }
}
