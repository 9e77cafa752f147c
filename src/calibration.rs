use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::{
    commands::{CommandSink, CALIBRATION_APPLY, CALIBRATION_PERSIST},
    error::{PowerMeterError, Result},
};

/// Crank arm to calibrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalibrationSide {
    /// Left crank arm
    #[default]
    Left,
    /// Right crank arm
    Right,
}

impl CalibrationSide {
    /// Side letter used in calibration mnemonics
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::Left => 'L',
            Self::Right => 'R',
        }
    }
}

impl fmt::Display for CalibrationSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "Left Side"),
            Self::Right => write!(f, "Right Side"),
        }
    }
}

/// Wizard step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalibrationStep {
    /// Choose side and weight
    #[default]
    SelectSide,
    /// Mount the weight on the pedal
    Prepare,
    /// Hold the crank still while the meter samples
    Hold,
    /// Save the applied calibration
    Verify,
}

impl CalibrationStep {
    /// Step heading
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::SelectSide => "Select Side",
            Self::Prepare => "Prepare",
            Self::Hold => "Hold Position",
            Self::Verify => "Verify and Save",
        }
    }

    /// Label of the button that advances this step
    #[must_use]
    pub const fn action_label(self) -> &'static str {
        match self {
            Self::SelectSide => "Start",
            Self::Prepare | Self::Hold => "Continue",
            Self::Verify => "Finish",
        }
    }
}

/// Optional side/weight input applied before advancing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WizardInput {
    /// Side to calibrate
    pub side: Option<CalibrationSide>,
    /// Weight in kilograms as entered by the user
    pub weight: Option<String>,
}

/// Four-step weight calibration sequence
///
/// ```text
/// SelectSide -> Prepare -> Hold -> Verify -> SelectSide
///                  CxW<w>     CA       CP
/// ```
///
/// The command sent while leaving a step is written before the step changes;
/// if the write fails the wizard stays put so the user can retry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationWizard {
    step: CalibrationStep,
    side: CalibrationSide,
    weight: String,
}

impl CalibrationWizard {
    /// Create a wizard at [`CalibrationStep::SelectSide`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current step
    #[must_use]
    pub const fn step(&self) -> CalibrationStep {
        self.step
    }

    /// Selected side
    #[must_use]
    pub const fn side(&self) -> CalibrationSide {
        self.side
    }

    /// Pending weight string
    #[must_use]
    pub fn weight(&self) -> &str {
        &self.weight
    }

    const fn is_selecting(&self) -> bool {
        matches!(self.step, CalibrationStep::SelectSide)
    }

    /// Select the side to calibrate; ignored once the sequence has started
    pub fn set_side(&mut self, side: CalibrationSide) {
        if self.is_selecting() {
            self.side = side;
        }
    }

    /// Set the calibration weight in kilograms; ignored once the sequence
    /// has started
    pub fn set_weight(&mut self, weight: impl Into<String>) {
        if self.is_selecting() {
            self.weight = weight.into();
        }
    }

    /// Apply side/weight input; only honoured while selecting
    pub fn apply_input(&mut self, input: WizardInput) {
        if let Some(side) = input.side {
            self.set_side(side);
        }
        if let Some(weight) = input.weight {
            self.set_weight(weight);
        }
    }

    /// Return to [`CalibrationStep::SelectSide`] and clear the weight
    pub fn reset(&mut self) {
        self.step = CalibrationStep::SelectSide;
        self.weight.clear();
    }

    /// Weight calibration command for the selected side, e.g. `CLW75`
    ///
    /// The weight is sent as entered.
    #[must_use]
    pub fn weight_command(&self) -> String {
        format!("C{}W{}", self.side.letter(), self.weight)
    }

    /// Instruction text for the current step
    #[must_use]
    pub fn instructions(&self) -> String {
        match self.step {
            CalibrationStep::SelectSide => {
                "Please select the side to calibrate and enter the weight you will use.".to_string()
            }
            CalibrationStep::Prepare => format!(
                "1. Mount your bike on a trainer\n\
                 2. Attach the {}kg weight to the pedal\n\
                 3. Position the crank arm parallel to the ground\n\
                 4. Click Continue when ready",
                self.weight.trim()
            ),
            CalibrationStep::Hold => {
                "Hold the position for 10 seconds.\nClick Continue when complete.".to_string()
            }
            CalibrationStep::Verify => {
                "Calibration complete. Click Finish to save the calibration.".to_string()
            }
        }
    }

    fn validate_weight(&self) -> Result<()> {
        let weight = self.weight.trim();
        if weight.is_empty() {
            return Err(PowerMeterError::InvalidInput(
                "calibration weight is required".to_string(),
            ));
        }
        match weight.parse::<f64>() {
            Ok(kg) if kg.is_finite() && kg > 0.0 => Ok(()),
            _ => Err(PowerMeterError::InvalidInput(format!(
                "calibration weight must be a positive number, got {weight:?}"
            ))),
        }
    }

    /// Move to the next step, sending the step's command through `sink`
    ///
    /// Returns the new step.
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::InvalidInput`] when leaving
    /// [`CalibrationStep::SelectSide`] without a valid weight, or the sink's
    /// error if a command write fails. In both cases the step is unchanged.
    pub async fn advance<S>(&mut self, sink: &S) -> Result<CalibrationStep>
    where
        S: CommandSink + ?Sized,
    {
        let next = match self.step {
            CalibrationStep::SelectSide => {
                self.validate_weight()?;
                CalibrationStep::Prepare
            }
            CalibrationStep::Prepare => {
                sink.send_command(&self.weight_command()).await?;
                CalibrationStep::Hold
            }
            CalibrationStep::Hold => {
                sink.send_command(CALIBRATION_APPLY).await?;
                CalibrationStep::Verify
            }
            CalibrationStep::Verify => {
                sink.send_command(CALIBRATION_PERSIST).await?;
                info!(side = %self.side, "Calibration persisted");
                self.weight.clear();
                CalibrationStep::SelectSide
            }
        };

        self.step = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::RecordingSink;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_full_cycle_sends_commands_in_order() {
        let sink = RecordingSink::default();
        let mut wizard = CalibrationWizard::new();
        wizard.set_side(CalibrationSide::Left);
        wizard.set_weight("75");

        assert_eq!(
            assert_ok!(wizard.advance(&sink).await),
            CalibrationStep::Prepare
        );
        assert!(sink.sent().is_empty());
        assert_eq!(assert_ok!(wizard.advance(&sink).await), CalibrationStep::Hold);
        assert_eq!(
            assert_ok!(wizard.advance(&sink).await),
            CalibrationStep::Verify
        );
        assert_eq!(
            assert_ok!(wizard.advance(&sink).await),
            CalibrationStep::SelectSide
        );

        assert_eq!(sink.sent(), vec!["CLW75", "CA", "CP"]);
        assert!(wizard.weight().is_empty());
    }

    #[tokio::test]
    async fn test_right_side_command() {
        let sink = RecordingSink::default();
        let mut wizard = CalibrationWizard::new();
        wizard.apply_input(WizardInput {
            side: Some(CalibrationSide::Right),
            weight: Some("12.5".to_string()),
        });

        wizard.advance(&sink).await.unwrap();
        wizard.advance(&sink).await.unwrap();
        assert_eq!(sink.sent(), vec!["CRW12.5"]);
    }

    #[tokio::test]
    async fn test_select_side_requires_valid_weight() {
        let sink = RecordingSink::default();
        let mut wizard = CalibrationWizard::new();

        let result = wizard.advance(&sink).await;
        assert!(matches!(
            assert_err!(result),
            PowerMeterError::InvalidInput(_)
        ));

        for bad in ["abc", "-5", "0", "NaN"] {
            wizard.set_weight(bad);
            assert_err!(wizard.advance(&sink).await);
            assert_eq!(wizard.step(), CalibrationStep::SelectSide);
        }
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_keeps_step() {
        let sink = RecordingSink::default();
        let mut wizard = CalibrationWizard::new();
        wizard.set_weight("20");
        wizard.advance(&sink).await.unwrap();

        sink.set_failing(true);
        assert_err!(wizard.advance(&sink).await);
        assert_eq!(wizard.step(), CalibrationStep::Prepare);

        sink.set_failing(false);
        assert_eq!(wizard.advance(&sink).await.unwrap(), CalibrationStep::Hold);
        assert_eq!(sink.sent(), vec!["CLW20"]);
    }

    #[test]
    fn test_input_ignored_outside_select_side() {
        let mut wizard = CalibrationWizard {
            step: CalibrationStep::Hold,
            side: CalibrationSide::Left,
            weight: "10".to_string(),
        };
        wizard.apply_input(WizardInput {
            side: Some(CalibrationSide::Right),
            weight: Some("99".to_string()),
        });
        assert_eq!(wizard.weight_command(), "CLW10");

        wizard.reset();
        assert_eq!(wizard.step(), CalibrationStep::SelectSide);
        assert!(wizard.weight().is_empty());
    }

    #[tokio::test]
    async fn test_setters_locked_after_start() {
        let sink = RecordingSink::default();
        let mut wizard = CalibrationWizard::new();
        wizard.set_weight("75");
        wizard.advance(&sink).await.unwrap();

        wizard.set_side(CalibrationSide::Right);
        wizard.set_weight("99");
        assert_eq!(wizard.side(), CalibrationSide::Left);
        assert!(wizard.instructions().contains("Attach the 75kg weight"));

        wizard.advance(&sink).await.unwrap();
        assert_eq!(sink.sent(), vec!["CLW75"]);
    }

    #[test]
    fn test_presentation_text() {
        let mut wizard = CalibrationWizard::new();
        assert_eq!(wizard.step().action_label(), "Start");
        wizard.set_weight("75");
        wizard.step = CalibrationStep::Prepare;
        assert!(wizard.instructions().contains("Attach the 75kg weight"));
        assert_eq!(wizard.step().action_label(), "Continue");
        assert_eq!(CalibrationStep::Verify.action_label(), "Finish");
        assert_eq!(CalibrationStep::Verify.title(), "Verify and Save");
    }
}
