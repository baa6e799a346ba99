use std::{fmt::Display, io};

use dfufile::DfuFileError;
use udfu::DfuError;

pub enum CliError {
    IO(io::Error),
    Dfu(DfuError),
    File(DfuFileError),
    NoDFUDevice,
    ManyDFUDevices,
    WrongDevice { vid: u16, pid: u16 },
    NoTarget(Option<u8>),
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DfuError> for CliError {
    fn from(value: DfuError) -> Self {
        CliError::Dfu(value)
    }
}

impl From<DfuFileError> for CliError {
    fn from(value: DfuFileError) -> Self {
        CliError::File(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Dfu(err) => write!(f, "DFU error: {err}"),
            CliError::File(err) => write!(f, "DFU file error: {err}"),
            CliError::NoDFUDevice => write!(f, "No DFU device"),
            CliError::ManyDFUDevices => write!(f, "More than one DFU devices"),
            CliError::WrongDevice { vid, pid } => write!(
                f,
                "File is meant for {vid:04x}:{pid:04x}, use --force to write anyway"
            ),
            CliError::NoTarget(Some(alt)) => {
                write!(f, "File has no image for alternate setting {alt}")
            }
            CliError::NoTarget(None) => write!(f, "File has no image"),
        }
    }
}
