//! Modem command scripts.
//!
//! A script is a `\n`-separated list of entries. A leading `?` marks an
//! entry whose failure is logged and skipped instead of aborting the script;
//! an entry `~N` inserts an N millisecond settle delay during which the
//! inner transport keeps being pumped.

use std::time::Duration;

/// One step of a parsed command script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep<'a> {
    /// Send the command line and wait for its final response.
    Command {
        line: &'a str,
        /// A failed response is logged and skipped instead of aborting.
        ignore_failure: bool,
    },
    /// Let the modem settle for the given time.
    Delay(Duration),
}

/// Parse a script string into steps. Empty entries are skipped.
pub fn parse_script(script: &str) -> Vec<ScriptStep<'_>> {
    script
        .split('\n')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if let Some(ms) = entry.strip_prefix('~') {
                ScriptStep::Delay(Duration::from_millis(ms.parse().unwrap_or(0)))
            } else if let Some(line) = entry.strip_prefix('?') {
                ScriptStep::Command {
                    line,
                    ignore_failure: true,
                }
            } else {
                ScriptStep::Command {
                    line: entry,
                    ignore_failure: false,
                }
            }
        })
        .collect()
}

/// Hardware initialisation sequence for the USSD dialect.
pub const INIT_SCRIPT: &str =
    "ATZ\n~100\nATE0\nAT+CMEE=2\nAT+CREG=2\nAT+CUSD=1\n?AT+CUSD=2\n?AT&W\nAT+CREG?";

/// Carrier information queries run after initialisation.
pub const INFO_SCRIPT: &str = "AT+CREG?\n?AT+CSQ\n?AT+COPS?\n?AT+CIMI\n?AT+GMI\n?AT+GMM\n?AT+GMR";

/// Minimal initialisation for the UDP dialect.
pub const UDP_INIT_SCRIPT: &str = "ATZ\n~100\nATE0\nAT+CMEE=2\nAT+CREG?\n?AT+CIMI";

/// Full modem restart, with time for the radio to come back.
pub const FORCE_RESET_SCRIPT: &str = "AT+CFUN=1,1\n~5000";

/// End the current USSD session.
pub const USSD_END_COMMAND: &str = "AT+CUSD=2";

/// Clear the forbidden-operator list, issued with the reset sequence when
/// registration is refused.
pub const CLEAR_FPLMN_SCRIPT: &str = "?AT+CRSM=214,28539,0,0,12,\"FFFFFFFFFFFFFFFFFFFFFFFF\"";
