// Copyright 2026 Flowtrack contributors.
//
// This file is part of Flowtrack.
//
// Flowtrack is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// Flowtrack is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
// for more details.
//
// You should have received a copy of the GNU General Public License
// along with Flowtrack. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use etherparse::{IpNumber, IpSlice, TcpSlice, UdpSlice};

pub mod flowtab;

use flowtab::FlowKey;

/// Extract the unidirectional flow identity from a raw IP packet as
/// delivered by the capture ring (network header first, no link
/// layer).
///
/// Returns `Ok(None)` for IPv6: the ring only asks the kernel for
/// IPv4, so this is belt-and-braces rather than a hot case. Transport
/// ports are taken from TCP and UDP headers; every other transport
/// records zero ports, which still yields a stable per-host key.
pub fn flow_key(raw: &[u8]) -> Result<Option<FlowKey>> {
    let ip = IpSlice::from_slice(raw)?;

    let v4 = match &ip {
        IpSlice::Ipv4(v4) => v4,
        IpSlice::Ipv6(_) => return Ok(None),
    };

    let proto = ip.payload().ip_number;
    let (src_port, dst_port) = match proto {
        IpNumber::TCP => {
            let tcp = TcpSlice::from_slice(ip.payload().payload)?;
            (tcp.source_port(), tcp.destination_port())
        }
        IpNumber::UDP => {
            let udp = UdpSlice::from_slice(ip.payload().payload)?;
            (udp.source_port(), udp.destination_port())
        }
        _ => (0, 0),
    };

    Ok(Some(FlowKey {
        src_ip: u32::from_be_bytes(v4.header().source()),
        dst_ip: u32::from_be_bytes(v4.header().destination()),
        src_port,
        dst_port,
        proto: proto.0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn udp_packet_yields_key() {
        let mut buf = Vec::new();
        PacketBuilder::ipv4([1, 1, 1, 1], [2, 2, 2, 2], 64)
            .udp(40000, 53)
            .write(&mut buf, b"hi")
            .unwrap();

        let key = flow_key(&buf).unwrap().unwrap();
        assert_eq!(key.src_ip, 0x0101_0101);
        assert_eq!(key.dst_ip, 0x0202_0202);
        assert_eq!(key.src_port, 40000);
        assert_eq!(key.dst_port, 53);
        assert_eq!(key.proto, 17);
    }

    #[test]
    fn tcp_packet_yields_key() {
        let mut buf = Vec::new();
        PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(1000, 80, 0, 1024)
            .write(&mut buf, &[])
            .unwrap();

        let key = flow_key(&buf).unwrap().unwrap();
        assert_eq!(key.proto, 6);
        assert_eq!(key.src_port, 1000);
        assert_eq!(key.dst_port, 80);
    }

    #[test]
    fn non_port_transport_gets_zero_ports() {
        use etherparse::{IcmpEchoHeader, Icmpv4Type};

        let mut buf = Vec::new();
        PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .icmpv4(Icmpv4Type::EchoRequest(IcmpEchoHeader { id: 1, seq: 1 }))
            .write(&mut buf, &[])
            .unwrap();

        let key = flow_key(&buf).unwrap().unwrap();
        assert_eq!(key.proto, 1);
        assert_eq!(key.src_port, 0);
        assert_eq!(key.dst_port, 0);
    }

    #[test]
    fn ipv6_is_skipped() {
        let mut buf = Vec::new();
        PacketBuilder::ipv6([1; 16], [2; 16], 64)
            .udp(1, 2)
            .write(&mut buf, &[])
            .unwrap();

        assert!(flow_key(&buf).unwrap().is_none());
    }

    #[test]
    fn truncated_packet_is_an_error() {
        assert!(flow_key(&[0x45, 0x00, 0x00]).is_err());
    }
}
