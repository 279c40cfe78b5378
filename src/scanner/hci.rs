//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to receive BLE advertising
//! reports without requiring the BlueZ daemon. Each report carries the
//! advertiser address, the raw advertisement payload, and the RSSI byte,
//! exactly the event shape the pipeline consumes. Requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{EVENT_CHANNEL_BUFFER_SIZE, EventError, ScanError, ScanEvent, ScanEventResult};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
#[repr(C, packed)]
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

/// LE Set Scan Enable command
#[repr(C, packed)]
struct LeSetScanEnableCmd {
    enable: u8,
    filter_dup: u8,
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Open a raw HCI socket bound to the given device.
fn open_hci_socket(dev_id: u16) -> Result<OwnedFd, ScanError> {
    // Raw Bluetooth HCI socket via libc directly since nix doesn't support
    // BTPROTO_HCI. SOCK_NONBLOCK is required for AsyncFd.
    let raw = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };
    if raw < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to create HCI socket: {}",
            io::Error::last_os_error()
        )));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to bind HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(fd)
}

/// Restrict the socket to LE meta events.
fn set_event_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to set HCI filter: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };
    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to send HCI command: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Configure and enable passive LE scanning.
fn enable_le_scan(fd: &OwnedFd) -> Result<(), ScanError> {
    let params = LeSetScanParametersCmd {
        scan_type: LE_SCAN_PASSIVE,
        interval: 0x0030, // 30ms in 0.625ms units
        window: 0x0030,   // 30ms in 0.625ms units
        own_address_type: LE_PUBLIC_ADDRESS,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    };
    let params_bytes = unsafe {
        std::slice::from_raw_parts(
            &params as *const LeSetScanParametersCmd as *const u8,
            mem::size_of::<LeSetScanParametersCmd>(),
        )
    };
    send_hci_command(
        fd,
        &hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, params_bytes),
    )?;

    let enable = LeSetScanEnableCmd {
        enable: 0x01,
        filter_dup: 0x00, // Don't filter duplicates; every advertisement counts
    };
    let enable_bytes = unsafe {
        std::slice::from_raw_parts(
            &enable as *const LeSetScanEnableCmd as *const u8,
            mem::size_of::<LeSetScanEnableCmd>(),
        )
    };
    send_hci_command(
        fd,
        &hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, enable_bytes),
    )?;

    Ok(())
}

/// Carve a scan event out of an LE advertising report.
///
/// Report layout after the 4-byte HCI header: number of reports, then per
/// report the event type, address type, address (little-endian), data
/// length, data, and a trailing RSSI byte. Only the first report is used;
/// the controller delivers reports one at a time in practice.
fn parse_advertising_report(data: &[u8], verbose: bool) -> Option<ScanEventResult> {
    if data.len() < 12 {
        return verbose.then(|| {
            Err(EventError::MalformedReport(
                "advertising report too short".into(),
            ))
        });
    }

    // Skip packet type, event code, parameter length, subevent code
    let report = &data[4..];

    let num_reports = report[0] as usize;
    if num_reports == 0 {
        return None;
    }

    // num_reports(1) + event_type(1) + addr_type(1) + addr(6) + data_len(1)
    if report.len() < 10 {
        return None;
    }

    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);
    addr.reverse(); // HCI transmits the address little-endian

    let data_len = report[9] as usize;
    if report.len() < 11 + data_len {
        return verbose.then(|| {
            Err(EventError::MalformedReport(
                "advertising data overruns report".into(),
            ))
        });
    }

    let payload = report[10..10 + data_len].to_vec();
    let signal = i16::from(report[10 + data_len] as i8);

    Some(Ok(ScanEvent {
        address: MacAddress(addr),
        signal,
        payload,
    }))
}

/// Start scanning using raw HCI sockets.
///
/// Opens a raw HCI socket, enables passive LE scanning, and forwards
/// advertising reports as scan events. Runs indefinitely until
/// interrupted.
///
/// # Arguments
/// * `verbose` - If true, malformed reports are sent as Err values;
///   otherwise they're silently dropped.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan(verbose: bool) -> Result<mpsc::Receiver<ScanEventResult>, ScanError> {
    // Event socket receives advertising reports
    let fd = open_hci_socket(0)?;
    set_event_filter(&fd)?;

    // Separate socket for sending the scan configuration commands
    let cmd_fd = open_hci_socket(0)?;
    enable_le_scan(&cmd_fd)?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

    tokio::spawn(async move {
        let _cmd_fd = cmd_fd; // Keep command socket alive
        let mut buf = [0u8; 258]; // Max HCI event size

        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(_) => break,
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break,  // EOF or empty read
                    Ok(Err(_)) => break, // Read error
                    Err(_) => break,     // WouldBlock - no more data
                };

                if n >= 4
                    && buf[0] == HCI_EVENT_PKT
                    && buf[1] == EVT_LE_META_EVENT
                    && buf[3] == EVT_LE_ADVERTISING_REPORT
                    && let Some(result) = parse_advertising_report(&buf[..n], verbose)
                {
                    let _ = tx.send(result).await;
                }
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::{LocalName, parse_local_name};

    /// Build a full HCI advertising-report packet around an AD payload.
    fn report_packet(addr_le: [u8; 6], payload: &[u8], rssi: i8) -> Vec<u8> {
        let mut packet = vec![
            HCI_EVENT_PKT,
            EVT_LE_META_EVENT,
            0x00, // parameter length (unused by the parser)
            EVT_LE_ADVERTISING_REPORT,
            0x01, // one report
            0x00, // event type
            0x00, // address type
        ];
        packet.extend_from_slice(&addr_le);
        packet.push(payload.len() as u8);
        packet.extend_from_slice(payload);
        packet.push(rssi as u8);
        packet
    }

    #[test]
    fn test_hci_filter_setup() {
        let mut filter = HciFilter::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_event(EVT_LE_META_EVENT);

        // HCI_EVENT_PKT (0x04) sets bit 4 in type_mask
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // EVT_LE_META_EVENT (0x3E = 62) sets bit 30 in event_mask[1]
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
    }

    #[test]
    fn test_hci_command_packet() {
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00]);

        assert_eq!(packet[0], 0x01); // Command packet type
        assert_eq!(packet.len(), 6); // Header + 2 params
    }

    #[test]
    fn test_parse_advertising_report() {
        let payload = [0x04, 0x09, b'T', b'a', b'g'];
        // Address on the wire is little-endian
        let packet = report_packet([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA], &payload, -60);

        let event = parse_advertising_report(&packet, false).unwrap().unwrap();
        assert_eq!(event.address.to_string(), "aabbccddeeff");
        assert_eq!(event.signal, -60);
        assert_eq!(
            parse_local_name(&event.payload),
            LocalName::Name("Tag".to_string())
        );
    }

    #[test]
    fn test_parse_advertising_report_weak_signal() {
        let packet = report_packet([0x01; 6], &[], -104);
        let event = parse_advertising_report(&packet, false).unwrap().unwrap();
        assert_eq!(event.signal, -104);
        assert!(event.payload.is_empty());
    }

    #[test]
    fn test_short_report_dropped_silently() {
        assert!(parse_advertising_report(&[HCI_EVENT_PKT, 0x00], false).is_none());
    }

    #[test]
    fn test_short_report_errors_when_verbose() {
        let result = parse_advertising_report(&[HCI_EVENT_PKT, 0x00], true);
        assert!(matches!(
            result,
            Some(Err(EventError::MalformedReport(_)))
        ));
    }

    #[test]
    fn test_truncated_data_errors_when_verbose() {
        let mut packet = report_packet([0x01; 6], &[0x02, 0x09, b'x'], -60);
        packet.truncate(packet.len() - 2); // Lose part of the data and the RSSI byte

        assert!(parse_advertising_report(&packet, false).is_none());
        assert!(matches!(
            parse_advertising_report(&packet, true),
            Some(Err(EventError::MalformedReport(_)))
        ));
    }

    #[test]
    fn test_zero_reports_dropped() {
        let packet = vec![
            HCI_EVENT_PKT,
            EVT_LE_META_EVENT,
            0x00,
            EVT_LE_ADVERTISING_REPORT,
            0x00, // zero reports
            0, 0, 0, 0, 0, 0, 0, 0,
        ];
        assert!(parse_advertising_report(&packet, true).is_none());
    }
}
