use crate::error::{PowerMeterError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Presentation grouping of catalog commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandCategory {
    /// Strain gauge calibration
    Calibration,
    /// Persistent meter settings
    Settings,
    /// Maintenance and diagnostics
    System,
}

impl CommandCategory {
    /// All categories in display order
    pub const ALL: [Self; 3] = [Self::Calibration, Self::Settings, Self::System];
}

impl fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calibration => write!(f, "Calibration"),
            Self::Settings => write!(f, "Settings"),
            Self::System => write!(f, "System"),
        }
    }
}

/// Catalog entry for a vendor control command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    /// Mnemonic understood by the meter firmware
    pub mnemonic: &'static str,
    /// Human readable description
    pub description: &'static str,
    /// Unit or kind of the parameter, `None` for parameterless commands
    pub param: Option<&'static str>,
    /// Presentation category
    pub category: CommandCategory,
}

impl CommandSpec {
    const fn new(
        category: CommandCategory,
        mnemonic: &'static str,
        description: &'static str,
        param: Option<&'static str>,
    ) -> Self {
        Self {
            mnemonic,
            description,
            param,
            category,
        }
    }

    /// Check if the command takes a parameter
    #[must_use]
    pub const fn requires_param(&self) -> bool {
        self.param.is_some()
    }

    /// Parameter hint for display, e.g. `Param: kg`
    #[must_use]
    pub fn param_hint(&self) -> Option<String> {
        self.param.map(|unit| format!("Param: {unit}"))
    }
}

use CommandCategory::{Calibration, Settings, System};

/// Commands supported by the power meter firmware
pub const CATALOG: &[CommandSpec] = &[
    CommandSpec::new(Calibration, "CLW", "Calibrate left using weight", Some("kg")),
    CommandSpec::new(Calibration, "CRW", "Calibrate right using weight", Some("kg")),
    CommandSpec::new(Calibration, "CLF", "Calibrate left using force", Some("N")),
    CommandSpec::new(Calibration, "CRF", "Calibrate right using force", Some("N")),
    CommandSpec::new(Calibration, "CLS", "Calibration left set", Some("value")),
    CommandSpec::new(Calibration, "CRS", "Calibration right set", Some("value")),
    CommandSpec::new(Calibration, "CG", "Calibration get", None),
    CommandSpec::new(Calibration, "CA", "Calibration apply", None),
    CommandSpec::new(Calibration, "CV", "Calibration verify", None),
    CommandSpec::new(Calibration, "CP", "Calibration persist", None),
    CommandSpec::new(Calibration, "CL", "Calibration leave", None),
    CommandSpec::new(Settings, "GCR", "Get crank radius", None),
    CommandSpec::new(Settings, "SCR", "Set crank radius", Some("m or mm")),
    CommandSpec::new(Settings, "GED", "Get exponential decay", None),
    CommandSpec::new(Settings, "SED", "Set exponential decay", Some("0-1 or %")),
    CommandSpec::new(Settings, "GPAR", "Get power averaging over revolution", None),
    CommandSpec::new(Settings, "SPAR", "Set power averaging over revolution", Some("0...n")),
    CommandSpec::new(Settings, "GIPM", "Get instant power measure", None),
    CommandSpec::new(Settings, "SIPM", "Set instant power measure", Some("0 or 1")),
    CommandSpec::new(Settings, "GCLB", "Get active calibration values", None),
    CommandSpec::new(System, "OC", "Start offset compensation", None),
    CommandSpec::new(System, "LM", "Log mode set", Some("mode")),
];

/// Apply calibration
pub const CALIBRATION_APPLY: &str = "CA";

/// Persist calibration to device storage
pub const CALIBRATION_PERSIST: &str = "CP";

/// Look up a catalog entry by mnemonic
#[must_use]
pub fn find(mnemonic: &str) -> Option<&'static CommandSpec> {
    CATALOG.iter().find(|spec| spec.mnemonic == mnemonic)
}

/// Iterate the catalog entries of one category
pub fn by_category(category: CommandCategory) -> impl Iterator<Item = &'static CommandSpec> {
    CATALOG.iter().filter(move |spec| spec.category == category)
}

/// Build the full command string for a catalog entry
///
/// The device grammar is flat: the raw value follows the mnemonic without a
/// separator (`CLW75`). Values are not range checked. Parameterless commands
/// ignore the value.
#[must_use]
pub fn build_command(spec: &CommandSpec, value: &str) -> String {
    if spec.requires_param() {
        format!("{}{}", spec.mnemonic, value)
    } else {
        spec.mnemonic.to_string()
    }
}

/// Validate a mnemonic/value pair and produce the command string to send
///
/// The value is appended exactly as given; a value that is empty or only
/// whitespace counts as missing. Mnemonics outside the catalog are accepted
/// and sent as the mnemonic followed by the value, since the firmware may
/// understand undocumented commands.
///
/// # Errors
///
/// Returns [`PowerMeterError::MissingParameter`] if a catalog command needs
/// a value and none was given, or [`PowerMeterError::InvalidInput`] for an
/// empty mnemonic.
pub fn prepare_command(mnemonic: &str, value: Option<&str>) -> Result<String> {
    let mnemonic = mnemonic.trim();
    if mnemonic.is_empty() {
        return Err(PowerMeterError::InvalidInput(
            "command mnemonic is empty".to_string(),
        ));
    }

    let value = value.filter(|v| !v.trim().is_empty());

    match find(mnemonic) {
        Some(spec) => match (spec.param, value) {
            (Some(unit), None) => Err(PowerMeterError::MissingParameter {
                mnemonic: spec.mnemonic.to_string(),
                unit,
            }),
            (_, value) => Ok(build_command(spec, value.unwrap_or_default())),
        },
        None => {
            debug!(mnemonic, "sending command outside the catalog");
            Ok(format!("{mnemonic}{}", value.unwrap_or_default()))
        }
    }
}

/// Destination for outbound command strings
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Encode and write one command to the device
    async fn send_command(&self, command: &str) -> Result<()>;
}

/// Validate a command and send it through `sink`
///
/// Nothing is sent when validation fails.
///
/// # Errors
///
/// Returns validation errors from [`prepare_command`] or any error from the
/// sink's write.
pub async fn dispatch<S>(sink: &S, mnemonic: &str, value: Option<&str>) -> Result<String>
where
    S: CommandSink + ?Sized,
{
    let command = prepare_command(mnemonic, value)?;
    sink.send_command(&command).await?;
    Ok(command)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Sink that records every command it is given
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Mutex<Vec<String>>,
        pub(crate) fail: Mutex<bool>,
    }

    impl RecordingSink {
        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            *self.fail.lock().unwrap() = failing;
        }
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_command(&self, command: &str) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(PowerMeterError::WriteFailed("link busy".to_string()));
            }
            self.sent.lock().unwrap().push(command.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_catalog_mnemonics_are_unique() {
        for (i, spec) in CATALOG.iter().enumerate() {
            assert!(
                CATALOG[i + 1..].iter().all(|other| other.mnemonic != spec.mnemonic),
                "duplicate mnemonic {}",
                spec.mnemonic
            );
        }
        assert_eq!(CATALOG.len(), 22);
    }

    #[test]
    fn test_catalog_categories() {
        assert_eq!(by_category(CommandCategory::Calibration).count(), 11);
        assert_eq!(by_category(CommandCategory::Settings).count(), 9);
        let system: Vec<_> = by_category(CommandCategory::System)
            .map(|spec| spec.mnemonic)
            .collect();
        assert_eq!(system, vec!["OC", "LM"]);
    }

    #[test]
    fn test_build_command() {
        let clw = find("CLW").unwrap();
        assert_eq!(build_command(clw, "75"), "CLW75");
        assert_eq!(clw.param_hint().as_deref(), Some("Param: kg"));

        let ca = find("CA").unwrap();
        assert_eq!(build_command(ca, "ignored"), "CA");
        assert!(ca.param_hint().is_none());
    }

    #[test]
    fn test_prepare_command() {
        assert_eq!(prepare_command("SCR", Some("172.5")).unwrap(), "SCR172.5");
        assert_eq!(prepare_command("GCR", None).unwrap(), "GCR");
        assert_eq!(prepare_command("XYZ", Some("1")).unwrap(), "XYZ1");
        assert_eq!(prepare_command("XYZ", None).unwrap(), "XYZ");
        assert_eq!(prepare_command("LM", Some("2 ")).unwrap(), "LM2 ");

        let result = prepare_command("SED", Some("  "));
        assert!(matches!(
            assert_err!(result),
            PowerMeterError::MissingParameter { unit: "0-1 or %", .. }
        ));
        assert!(matches!(
            prepare_command("", None),
            Err(PowerMeterError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_missing_parameter_sends_nothing() {
        let sink = RecordingSink::default();

        let result = dispatch(&sink, "CLW", None).await;
        assert!(matches!(
            result,
            Err(PowerMeterError::MissingParameter { .. })
        ));
        assert!(sink.sent().is_empty());

        let command = assert_ok!(dispatch(&sink, "LM", Some("2")).await);
        assert_eq!(command, "LM2");
        assert_eq!(sink.sent(), vec!["LM2".to_string()]);
    }
}
