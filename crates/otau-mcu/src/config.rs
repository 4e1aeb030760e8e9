//! Emulator configuration.
//!
//! Fully data-driven: everything the binary needs can come from a TOML
//! file, with command-line flags standing in when no file is given. The
//! raw config is plain strings and numbers; [`McuConfig::validate`],
//! [`McuConfig::model_ids`], and [`McuConfig::fault_plan`] turn it into
//! typed values and reject bad input before the core starts.
//!
//! # Example
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//!
//! [transfer]
//! supported_page_size = 256
//! max_image_size = 131072
//!
//! models = ["0x1001", "0x1300"]
//!
//! [[faults]]
//! point = "page_store"
//! call = 3
//! status = "invalid_object"
//! delay_ms = 500
//! ```

use std::path::PathBuf;
use std::time::Duration;

use otau_wire::DfuStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::{FaultSpec, FaultTrigger, InjectionPoint};
use crate::memory::MIN_SUPPORTED_PAGE_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("supported page size {got} is below the minimum of {MIN_SUPPORTED_PAGE_SIZE}")]
    PageSizeTooSmall { got: u16 },

    #[error("unknown injection point '{0}'")]
    UnknownInjectionPoint(String),

    #[error("unknown fault status '{0}'")]
    UnknownStatus(String),

    #[error("unknown fault trigger '{0}' (expected \"always\" or a call number)")]
    UnknownTrigger(String),

    #[error("fault call number must be at least 1")]
    ZeroCallNumber,

    #[error("invalid model id '{0}': expected a 16-bit hex value")]
    InvalidModelId(String),
}

/// Complete emulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McuConfig {
    /// Serial port the modem is attached to.
    #[serde(default)]
    pub port: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// On-disk mirrors and the NVM document.
    #[serde(default)]
    pub files: FilesConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    /// File with the app-data blob every init must match. Unset means
    /// app data is accepted as-is.
    #[serde(default)]
    pub expected_app_data: Option<PathBuf>,

    /// Mesh models to register, as hex strings ("0x1001" or "1001").
    #[serde(default)]
    pub models: Vec<String>,

    /// Faults to arm before the core starts.
    #[serde(default)]
    pub faults: Vec<FaultConfig>,
}

fn default_baud_rate() -> u32 {
    115_200
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            files: FilesConfig::default(),
            transfer: TransferConfig::default(),
            expected_app_data: None,
            models: Vec::new(),
            faults: Vec::new(),
        }
    }
}

impl McuConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.supported_page_size < MIN_SUPPORTED_PAGE_SIZE {
            return Err(ConfigError::PageSizeTooSmall {
                got: self.transfer.supported_page_size,
            });
        }
        self.model_ids()?;
        self.fault_plan()?;
        Ok(())
    }

    /// Parse the configured model ids.
    pub fn model_ids(&self) -> Result<Vec<u16>, ConfigError> {
        self.models
            .iter()
            .map(|raw| {
                let digits = raw
                    .trim()
                    .strip_prefix("0x")
                    .or_else(|| raw.trim().strip_prefix("0X"))
                    .unwrap_or_else(|| raw.trim());
                u16::from_str_radix(digits, 16)
                    .map_err(|_| ConfigError::InvalidModelId(raw.clone()))
            })
            .collect()
    }

    /// Turn the fault entries into armable specs, in file order.
    pub fn fault_plan(&self) -> Result<Vec<(InjectionPoint, FaultSpec)>, ConfigError> {
        self.faults.iter().map(FaultConfig::to_spec).collect()
    }
}

// =============================================================================
// Files
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_app_data_file")]
    pub app_data: PathBuf,

    #[serde(default = "default_firmware_file")]
    pub firmware: PathBuf,

    #[serde(default = "default_sha256_file")]
    pub sha256: PathBuf,

    #[serde(default = "default_nvm_file")]
    pub nvm: PathBuf,
}

fn default_app_data_file() -> PathBuf {
    PathBuf::from("app_data")
}

fn default_firmware_file() -> PathBuf {
    PathBuf::from("firmware")
}

fn default_sha256_file() -> PathBuf {
    PathBuf::from("sha256")
}

fn default_nvm_file() -> PathBuf {
    PathBuf::from("nvm")
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            app_data: default_app_data_file(),
            firmware: default_firmware_file(),
            sha256: default_sha256_file(),
            nvm: default_nvm_file(),
        }
    }
}

// =============================================================================
// Transfer
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Largest page the device accepts, advertised in status responses.
    #[serde(default = "default_supported_page_size")]
    pub supported_page_size: u16,

    /// Upper bound on the whole image; 0 means unlimited.
    #[serde(default)]
    pub max_image_size: u32,
}

fn default_supported_page_size() -> u16 {
    1024
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            supported_page_size: default_supported_page_size(),
            max_image_size: 0,
        }
    }
}

// =============================================================================
// Faults
// =============================================================================

/// One fault entry. Omitting `status` makes it a no-response fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Injection point name: `pre_validation`, `after_pre_validation`,
    /// `page_create`, `page_store`, or `post_validation`.
    pub point: String,

    /// `"always"` or a 1-based call number.
    #[serde(default = "default_call")]
    pub call: CallSpec,

    /// Status to answer with; omitted means the response is suppressed.
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallSpec {
    Number(u32),
    Keyword(String),
}

fn default_call() -> CallSpec {
    CallSpec::Keyword("always".to_string())
}

impl FaultConfig {
    fn to_spec(&self) -> Result<(InjectionPoint, FaultSpec), ConfigError> {
        let point = parse_point(&self.point)?;
        let trigger = match &self.call {
            CallSpec::Number(0) => return Err(ConfigError::ZeroCallNumber),
            CallSpec::Number(n) => FaultTrigger::OnCall(*n),
            CallSpec::Keyword(word) if word.eq_ignore_ascii_case("always") => {
                FaultTrigger::Always
            }
            CallSpec::Keyword(word) => return Err(ConfigError::UnknownTrigger(word.clone())),
        };

        let spec = match &self.status {
            Some(name) => FaultSpec::with_status(trigger, parse_status(name)?),
            None => FaultSpec::no_response(trigger),
        };
        Ok((point, spec.delayed(Duration::from_millis(self.delay_ms))))
    }
}

fn parse_point(name: &str) -> Result<InjectionPoint, ConfigError> {
    Ok(match name {
        "pre_validation" => InjectionPoint::PreValidation,
        "after_pre_validation" => InjectionPoint::AfterPreValidation,
        "page_create" => InjectionPoint::PageCreate,
        "page_store" => InjectionPoint::PageStore,
        "post_validation" => InjectionPoint::PostValidation,
        other => return Err(ConfigError::UnknownInjectionPoint(other.to_string())),
    })
}

fn parse_status(name: &str) -> Result<DfuStatus, ConfigError> {
    Ok(match name {
        "success" => DfuStatus::Success,
        "insufficient_resources" => DfuStatus::InsufficientResources,
        "invalid_object" => DfuStatus::InvalidObject,
        "unsupported_type" => DfuStatus::UnsupportedType,
        "operation_not_permitted" => DfuStatus::OperationNotPermitted,
        "operation_failed" => DfuStatus::OperationFailed,
        "firmware_successfully_updated" => DfuStatus::FirmwareSuccessfullyUpdated,
        other => return Err(ConfigError::UnknownStatus(other.to_string())),
    })
}

// =============================================================================
// Tests
// =============================================================================
