use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::models::probe::ProbeFailure;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

const PAYLOAD: &[u8] = b"ncsi-resolver-probe";

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an echo request. The ICMPv6 checksum covers a pseudo-header and is
/// filled in by the kernel, so it is left zero here.
pub fn echo_request(v6: bool, ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.push(if v6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST });
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);

    if !v6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Strip the IPv4 header that raw sockets deliver. Datagram ICMP sockets
/// start directly at the ICMP type byte, whose high nibble is never 4.
fn icmp_message(buf: &[u8], v6: bool) -> Option<&[u8]> {
    match buf.first() {
        Some(first) if !v6 && first >> 4 == 4 => {
            let header_len = ((first & 0x0f) as usize) * 4;
            buf.get(header_len..)
        }
        Some(_) => Some(buf),
        None => None,
    }
}

/// True when `buf` is the echo reply for our sequence number. `ident` is
/// only checked on raw sockets; datagram sockets rewrite it.
pub fn is_echo_reply(buf: &[u8], v6: bool, ident: Option<u16>, seq: u16) -> bool {
    let Some(message) = icmp_message(buf, v6) else {
        return false;
    };
    if message.len() < 8 {
        return false;
    }
    let expected_type = if v6 { ICMPV6_ECHO_REPLY } else { ICMP_ECHO_REPLY };
    if message[0] != expected_type || u16::from_be_bytes([message[6], message[7]]) != seq {
        return false;
    }
    match ident {
        Some(ident) => u16::from_be_bytes([message[4], message[5]]) == ident,
        None => true,
    }
}

/// A reply counts only when it comes from the pinged host.
fn from_target(from: SocketAddr, ip: IpAddr) -> bool {
    from.ip().to_canonical() == ip.to_canonical()
}

/// Unprivileged datagram sockets first, raw sockets as the fallback. The
/// flag is true for a raw socket.
fn open_socket(v6: bool) -> io::Result<(UdpSocket, bool)> {
    let (domain, protocol) = if v6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };
    // `UdpSocket` only for its `recv_from`, which reports the sender.
    match Socket::new(domain, Type::DGRAM, Some(protocol)) {
        Ok(socket) => Ok((socket.into(), false)),
        Err(_) => Socket::new(domain, Type::RAW, Some(protocol)).map(|s| (s.into(), true)),
    }
}

/// Send one echo request and wait for the matching reply. Blocking; run it
/// on the blocking pool.
pub fn ping_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeFailure> {
    let v6 = ip.is_ipv6();
    let (socket, raw) = open_socket(v6).map_err(|e| ProbeFailure::Socket(e.to_string()))?;

    let ident = rand::random::<u16>();
    let seq = rand::random::<u16>();
    let packet = echo_request(v6, ident, seq, PAYLOAD);
    let expected_ident = raw.then_some(ident);

    let start = Instant::now();
    let deadline = start + timeout;
    socket
        .send_to(&packet, SocketAddr::new(ip, 0))
        .map_err(|e| ProbeFailure::Socket(e.to_string()))?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeFailure::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeFailure::Socket(e.to_string()))?;

        match socket.recv_from(&mut buf) {
            Ok((n, from)) if from_target(from, ip) && is_echo_reply(&buf[..n], v6, expected_ident, seq) => {
                return Ok(start.elapsed())
            }
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(ProbeFailure::Timeout(timeout));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProbeFailure::Socket(e.to_string())),
        }
    }
}

/// Async wrapper around [`ping_blocking`] with a hard outer deadline.
pub async fn ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeFailure> {
    let task = tokio::task::spawn_blocking(move || ping_blocking(ip, timeout));
    match tokio::time::timeout(timeout + Duration::from_millis(250), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ProbeFailure::Socket(join_err.to_string())),
        Err(_) => Err(ProbeFailure::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_of_request_verifies_to_zero() {
        let packet = echo_request(false, 0x1234, 7, PAYLOAD);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        // 0x0100 + 0x0200 (padded) = 0x0300 -> !0x0300
        assert_eq!(checksum(&[0x01, 0x00, 0x02]), !0x0300u16);
    }

    #[test]
    fn test_v6_request_leaves_checksum_to_kernel() {
        let packet = echo_request(true, 1, 2, b"x");
        assert_eq!(packet[0], ICMPV6_ECHO_REQUEST);
        assert_eq!(&packet[2..4], &[0, 0]);
        assert_eq!(&packet[6..8], &2u16.to_be_bytes());
    }

    #[test]
    fn test_reply_from_datagram_socket() {
        let mut reply = echo_request(false, 99, 42, PAYLOAD);
        reply[0] = ICMP_ECHO_REPLY;
        assert!(is_echo_reply(&reply, false, None, 42));
        assert!(!is_echo_reply(&reply, false, None, 43));
    }

    #[test]
    fn test_reply_from_raw_socket_skips_ip_header() {
        let mut datagram = vec![0x45u8];
        datagram.extend_from_slice(&[0u8; 19]);
        let mut reply = echo_request(false, 99, 42, PAYLOAD);
        reply[0] = ICMP_ECHO_REPLY;
        datagram.extend_from_slice(&reply);
        assert!(is_echo_reply(&datagram, false, Some(99), 42));
    }

    #[test]
    fn test_raw_reply_for_another_identifier_is_ignored() {
        let mut datagram = vec![0x45u8];
        datagram.extend_from_slice(&[0u8; 19]);
        let mut reply = echo_request(false, 7, 42, PAYLOAD);
        reply[0] = ICMP_ECHO_REPLY;
        datagram.extend_from_slice(&reply);
        assert!(!is_echo_reply(&datagram, false, Some(99), 42));
        assert!(is_echo_reply(&datagram, false, None, 42));
    }

    #[test]
    fn test_reply_must_come_from_pinged_host() {
        let target: IpAddr = "1.1.1.1".parse().unwrap();
        assert!(from_target("1.1.1.1:0".parse().unwrap(), target));
        assert!(!from_target("8.8.8.8:0".parse().unwrap(), target));
        assert!(from_target("[::ffff:1.1.1.1]:0".parse().unwrap(), target));
    }

    #[test]
    fn test_zero_timeout_never_waits_for_a_reply() {
        let result = ping_blocking("127.0.0.1".parse().unwrap(), Duration::ZERO);
        assert!(matches!(result, Err(ProbeFailure::Timeout(_)) | Err(ProbeFailure::Socket(_))), "{:?}", result);
    }

    #[test]
    fn test_request_is_not_a_reply() {
        let request = echo_request(false, 99, 42, PAYLOAD);
        assert!(!is_echo_reply(&request, false, None, 42));
        assert!(!is_echo_reply(&[], false, None, 42));
        assert!(!is_echo_reply(&[0, 0, 0], false, None, 42));
    }

    #[test]
    fn test_v6_reply() {
        let mut reply = echo_request(true, 1, 5, b"");
        reply[0] = ICMPV6_ECHO_REPLY;
        assert!(is_echo_reply(&reply, true, Some(1), 5));
    }
}
