//! Per-model command tables for the UDP dialect.
//!
//! Different modem families spell the packet-data attach and the datagram
//! path differently; everything model-specific lives in a
//! [`UdpModemConfig`] so the transport itself stays generic. Templates use
//! `{apn}` / `{host}` / `{port}` / `{len}` placeholders.

/// Command templates for one modem family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpModemConfig {
    /// Family name, for logs.
    pub name: &'static str,
    /// Configure the access point name. `{apn}` substituted.
    pub apn_config: &'static str,
    /// Activate the packet data context.
    pub context_activate: &'static str,
    /// Create the datagram socket. `{host}`/`{port}` substituted when the
    /// family connects at creation time.
    pub socket_create: &'static str,
    /// Query the local address.
    pub local_address: &'static str,
    /// Prefix of the response line carrying the local address; empty means
    /// the next bare line is the address.
    pub local_address_prefix: &'static str,
    /// Connect the socket to the remote endpoint; empty when the family
    /// folds the connect into socket creation.
    pub remote_connect: &'static str,
    /// Start a datagram send. `{len}`/`{host}`/`{port}` substituted.
    pub send_command: &'static str,
    /// Line confirming the datagram left the modem.
    pub send_confirm: &'static str,
    /// Prefix of the unsolicited receive notification.
    pub receive_notification: &'static str,
    /// Read the pending datagram.
    pub read_command: &'static str,
    /// Prefix of the read response header whose first integer is the
    /// datagram length.
    pub read_header: &'static str,
}

/// Quectel BG96 family.
pub const QUECTEL_BG96: UdpModemConfig = UdpModemConfig {
    name: "quectel-bg96",
    apn_config: "AT+QICSGP=1,1,\"{apn}\",\"\",\"\",1",
    context_activate: "AT+QIACT=1",
    socket_create: "AT+QIOPEN=1,0,\"UDP\",\"{host}\",{port},0,0",
    local_address: "AT+QIACT?",
    local_address_prefix: "+QIACT:",
    remote_connect: "",
    send_command: "AT+QISEND=0,{len}",
    send_confirm: "SEND OK",
    receive_notification: "+QIURC: \"recv\"",
    read_command: "AT+QIRD=0",
    read_header: "+QIRD:",
};

/// SIMCom SIM7000 family.
pub const SIMCOM_SIM7000: UdpModemConfig = UdpModemConfig {
    name: "simcom-sim7000",
    apn_config: "AT+CSTT=\"{apn}\"",
    context_activate: "AT+CIICR",
    socket_create: "AT+CIPSTART=\"UDP\",\"{host}\",\"{port}\"",
    local_address: "AT+CIFSR",
    local_address_prefix: "",
    remote_connect: "",
    send_command: "AT+CIPSEND={len}",
    send_confirm: "SEND OK",
    receive_notification: "+CIPRXGET: 1",
    read_command: "AT+CIPRXGET=2,1460",
    read_header: "+CIPRXGET: 2,",
};

/// u-blox SARA family.
pub const UBLOX_SARA: UdpModemConfig = UdpModemConfig {
    name: "ublox-sara",
    apn_config: "AT+CGDCONT=1,\"IP\",\"{apn}\"",
    context_activate: "AT+CGACT=1,1",
    socket_create: "AT+USOCR=17",
    local_address: "AT+CGPADDR=1",
    local_address_prefix: "+CGPADDR:",
    remote_connect: "AT+USOCO=0,\"{host}\",{port}",
    send_command: "AT+USOST=0,\"{host}\",{port},{len}",
    send_confirm: "+USOST:",
    receive_notification: "+UUSORF:",
    read_command: "AT+USORF=0,1024",
    read_header: "+USORF:",
};

/// Substitute `{key}` placeholders in a command template.
pub fn expand(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_substitutes_all_placeholders() {
        assert_eq!(
            expand(QUECTEL_BG96.socket_create, &[("host", "10.0.0.1"), ("port", "5555")]),
            "AT+QIOPEN=1,0,\"UDP\",\"10.0.0.1\",5555,0,0"
        );
        assert_eq!(
            expand(UBLOX_SARA.apn_config, &[("apn", "internet")]),
            "AT+CGDCONT=1,\"IP\",\"internet\""
        );
    }

    #[test]
    fn families_are_distinct() {
        assert_ne!(QUECTEL_BG96, SIMCOM_SIM7000);
        assert_ne!(SIMCOM_SIM7000, UBLOX_SARA);
    }
}
