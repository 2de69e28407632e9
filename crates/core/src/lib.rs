pub mod adb;
pub mod controller;
pub mod detector;
pub mod device;
pub mod error;
pub mod events;
pub mod gesture;
pub mod hunter;
pub mod logger;
pub mod matcher;
pub mod platform;
pub mod scheduler;
pub mod settings;
pub mod sleep;
pub mod types;
pub mod worker;
