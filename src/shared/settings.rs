//! Device settings: read a field's device configuration, toggle devices and
//! save mode + intensity as one compensated operation

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::GreenhouseApi;
use crate::domain::{DeviceConfig, DeviceKind, DeviceMode, FieldSettings, RepeatRule};
use crate::error::{error_codes, ClientError, ErrorResponse};
use crate::time::{time_of_day_after, Clock};
use crate::validators::{
    validate_intensity, validate_schedule_date, validate_turn_on_at, ValidationError,
    MAX_INTENSITY,
};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Nothing was changed on the backend
    #[error("Settings save rejected: {0}")]
    Rejected(ClientError),

    /// The configuration was written but the intensity was not
    #[error("Intensity update failed after the configuration was saved (compensated: {compensated}): {source}")]
    PartialFailure {
        compensated: bool,
        source: ClientError,
    },

    #[error("{0}")]
    Remote(#[from] ClientError),
}

impl SettingsError {
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            SettingsError::Validation(e) => {
                ErrorResponse::new(error_codes::INVALID_VALUE, e.message.clone())
            }
            SettingsError::PartialFailure { .. } => {
                ErrorResponse::new(error_codes::PARTIAL_FAILURE, self.to_string())
            }
            SettingsError::Rejected(e) | SettingsError::Remote(e) => e.to_error_response(),
        }
    }
}

impl From<SettingsError> for ErrorResponse {
    fn from(err: SettingsError) -> Self {
        err.to_error_response()
    }
}

/// Mode-specific parameters of a save
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeSettings {
    /// `turn_off_after` minutes; 0 means never
    Manual { turn_off_after: u32 },
    Scheduled {
        turn_on_at: String,
        turn_off_after: u32,
        repeat: RepeatRule,
        dates: Vec<String>,
    },
    /// The backend drives the device; intensity is pinned to 100
    Automatic,
}

impl ModeSettings {
    /// Schedule starting 30 minutes from now, today only
    pub fn default_schedule(clock: &dyn Clock) -> Self {
        ModeSettings::Scheduled {
            turn_on_at: time_of_day_after(clock, 30),
            turn_off_after: 0,
            repeat: RepeatRule::Today,
            dates: Vec::new(),
        }
    }

    pub fn mode(&self) -> DeviceMode {
        match self {
            ModeSettings::Manual { .. } => DeviceMode::Manual,
            ModeSettings::Scheduled { .. } => DeviceMode::Scheduled,
            ModeSettings::Automatic => DeviceMode::Automatic,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let ModeSettings::Scheduled {
            turn_on_at,
            repeat,
            dates,
            ..
        } = self
        {
            validate_turn_on_at(turn_on_at)?;
            for date in dates {
                validate_schedule_date(date)?;
            }
            if *repeat == RepeatRule::Custom && dates.is_empty() {
                return Err(ValidationError::new(
                    "dates",
                    "A custom repeat rule needs at least one date",
                ));
            }
        }
        Ok(())
    }

    /// Configuration body persisted for this mode
    pub fn to_config(&self) -> DeviceConfig {
        match self {
            ModeSettings::Manual { turn_off_after } => DeviceConfig {
                mode: Some(DeviceMode::Manual),
                turn_off_after: Some(*turn_off_after),
                ..Default::default()
            },
            ModeSettings::Scheduled {
                turn_on_at,
                turn_off_after,
                repeat,
                dates,
            } => DeviceConfig {
                mode: Some(DeviceMode::Scheduled),
                turn_off_after: Some(*turn_off_after),
                turn_on_at: Some(turn_on_at.clone()),
                repeat: Some(*repeat),
                dates: Some(dates.clone()),
            },
            ModeSettings::Automatic => DeviceConfig {
                mode: Some(DeviceMode::Automatic),
                ..Default::default()
            },
        }
    }
}

/// One device save: live intensity plus mode configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSave {
    pub intensity: u8,
    pub mode: ModeSettings,
}

impl DeviceSave {
    /// Intensity actually sent; automatic mode always runs at 100
    pub fn effective_intensity(&self) -> u8 {
        match self.mode {
            ModeSettings::Automatic => MAX_INTENSITY,
            _ => self.intensity,
        }
    }
}

/// What a settings screen shows for one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceView {
    pub device: DeviceKind,
    pub mode: DeviceMode,
    pub config: DeviceConfig,
    /// Newest reported intensity, if the device has reported one
    pub intensity: Option<u8>,
    pub is_on: bool,
}

/// Outcome of a successful save
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub device: DeviceKind,
    pub config: DeviceConfig,
    pub intensity: u8,
    pub previous_config: Option<DeviceConfig>,
    pub previous_intensity: Option<u8>,
}

/// Device settings operations against the greenhouse service
pub struct DeviceSettingsService {
    api: Arc<dyn GreenhouseApi>,
}

impl DeviceSettingsService {
    pub fn new(api: Arc<dyn GreenhouseApi>) -> Self {
        Self { api }
    }

    pub async fn load(
        &self,
        greenhouse_id: &str,
        field_index: usize,
    ) -> Result<FieldSettings, SettingsError> {
        Ok(self.api.field_settings(greenhouse_id, field_index).await?)
    }

    /// Current mode, configuration and intensity of one device
    pub fn device_view(settings: &FieldSettings, device: DeviceKind) -> DeviceView {
        let config = settings.metadata.config(device).cloned().unwrap_or_default();
        let intensity = settings
            .sensors
            .latest(device.status_series())
            .map(|r| r.value.round().clamp(0.0, MAX_INTENSITY as f64) as u8);
        DeviceView {
            device,
            mode: config.mode.unwrap_or(DeviceMode::Manual),
            config,
            intensity,
            is_on: intensity.map(|v| v > 0).unwrap_or(false),
        }
    }

    /// Flip a device between off (0) and full (100); returns the value sent
    pub async fn toggle(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        device: DeviceKind,
        currently_on: bool,
    ) -> Result<u8, SettingsError> {
        let value = if currently_on { 0 } else { MAX_INTENSITY };
        self.api
            .control_device(greenhouse_id, field_index, device, value)
            .await?;
        info!(greenhouse_id = %greenhouse_id, field_index, device = %device, value, "Toggled device");
        Ok(value)
    }

    /// Save configuration and intensity
    ///
    /// Order: read the current state, write the configuration, then the
    /// intensity. If the intensity write fails the previous configuration is
    /// written back. If the configuration write fails nothing else is sent.
    pub async fn save(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        device: DeviceKind,
        save: &DeviceSave,
    ) -> Result<SaveReport, SettingsError> {
        let intensity = save.effective_intensity();
        validate_intensity(intensity)?;
        save.mode.validate()?;

        let current = self
            .api
            .field_settings(greenhouse_id, field_index)
            .await
            .map_err(SettingsError::Rejected)?;
        let previous = Self::device_view(&current, device);
        let previous_config = current.metadata.config(device).cloned();
        let config = save.mode.to_config();

        self.api
            .update_device_config(greenhouse_id, field_index, device, &config)
            .await
            .map_err(|e| {
                warn!(greenhouse_id = %greenhouse_id, field_index, device = %device, error = %e, "Configuration write rejected");
                SettingsError::Rejected(e)
            })?;

        if let Err(source) = self
            .api
            .control_device(greenhouse_id, field_index, device, intensity)
            .await
        {
            error!(
                greenhouse_id = %greenhouse_id,
                field_index,
                device = %device,
                error = %source,
                "Intensity write failed, restoring previous configuration"
            );
            let restore = previous_config.clone().unwrap_or_default();
            let compensated = match self
                .api
                .update_device_config(greenhouse_id, field_index, device, &restore)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        greenhouse_id = %greenhouse_id,
                        field_index,
                        device = %device,
                        error = %e,
                        "Could not restore previous configuration"
                    );
                    false
                }
            };
            return Err(SettingsError::PartialFailure {
                compensated,
                source,
            });
        }

        info!(
            greenhouse_id = %greenhouse_id,
            field_index,
            device = %device,
            mode = ?config.mode,
            intensity,
            "Saved device settings"
        );
        Ok(SaveReport {
            device,
            config,
            intensity,
            previous_config,
            previous_intensity: previous.intensity,
        })
    }
}
