//! Session lifecycle: the generic state machine and the device table built on it

pub mod device;
pub mod machine;

pub use device::{
    build_device_machine, CommandOutbox, DeviceEvent, DeviceEventKind, DeviceMachine, DeviceState,
    NoEffects, SessionCommand, SessionEffects, SessionTimeouts,
};
pub use machine::{EventSender, MachineEvent, MachineStats, Rule, StateConfig, StateMachine};
