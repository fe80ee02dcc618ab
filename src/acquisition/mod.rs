pub mod controller;
pub mod region;

pub use controller::{
    AcquisitionController, AcquisitionSession, AcquisitionState, Reconfiguration, SessionInfo,
};
pub use region::{RegionRequest, Span};
