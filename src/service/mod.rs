pub mod recognition;
pub mod session;
pub mod training;

pub use recognition::{CycleThrottle, Identification, RecognitionPipeline};
pub use session::{
    EnrollmentReport, Mode, Networks, SessionController, SessionHandle, SessionState, StopReport,
};
pub use training::{Trainer, TrainingReport};
