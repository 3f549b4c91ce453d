use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/*
* Stable machine readable codes attached to every rejected request.
*/
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    // Request body
    ParamsInvalid,
    NameInvalid,
    UriInvalid,
    FilterInvalid,
    PayloadTooLarge,
    ReadOnlyCollection,

    // Templates
    TemplateNotFound,
    TemplateNameInUse,
    TemplateMediaMissing,
    TemplateMediaAmbiguous,
    TemplateDiskInvalid,
    TemplateVolumeRequired,
    NetworksNotArray,

    // Virtual machines
    VmNotFound,
    VmNameInUse,
    VmTemplateMissing,
    VmRunning,
    VmStateInvalid,
    VmBusy,
    CpusInvalid,
    MemoryInvalid,
    GraphicsInvalid,
    PasswdExpiryInvalid,
    UserNotFound,
    GroupNotFound,

    // Vm storage devices
    DeviceNotFound,
    DeviceNameInUse,
    DeviceUpdateInvalid,
    StorageSourceAmbiguous,
    StorageSourceMissing,
    StorageVolumeRequired,
    StoragePathNotFound,

    // Vm network interfaces
    IfaceNotFound,
    IfaceTypeInvalid,
    IfaceMacInUse,

    // Storage pools
    PoolNotFound,
    PoolNameInUse,
    PoolInactive,
    PoolActive,
    PoolInUseByTemplate,
    PoolVolumesInUse,
    PoolSourceInvalid,

    // Storage volumes
    VolumeNotFound,
    VolumeNameRequired,
    VolumeNameInUse,
    VolumeInUse,
    VolumeCapacityInvalid,

    // Networks
    NetworkNotFound,
    NetworkNameInUse,
    NetworkActive,
    NetworkInactive,
    NetworkInUseByTemplate,
    NetworkInUseByVm,
    NetworkSubnetOverlap,
    NetworkInterfaceRequired,

    // Snapshots
    SnapshotNotFound,
    SnapshotNameInUse,
    SnapshotNameReserved,

    // Tasks and reports
    TaskNotFound,
    ReportNotFound,
    ReportNameInUse,

    // Host software
    PackageNotFound,
    HostUpdateRunning,
    RepositoryNotFound,
    RepositoryIdInUse,
    RepositoryUrlInvalid,
}

/**
A caller facing rejection.
The reason is surfaced as the diagnostic code.
*/
#[derive(Debug, Error)]
#[error("{}", message)]
pub struct Rejection {
    pub reason: Reason,
    pub message: String,
    pub help: Option<String>,
}

impl Rejection {
    pub fn new(reason: Reason, msg: &str, help: Option<&str>) -> Self {
        Self {
            reason,
            message: msg.to_owned(),
            help: help.map(|e| e.to_owned()),
        }
    }
}

impl Diagnostic for Rejection {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.reason))
    }
    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.help
            .as_ref()
            .map(|e| Box::new(e) as Box<dyn fmt::Display + 'a>)
    }
}
