#![allow(async_fn_in_trait)]

pub mod calibration;
pub mod camera;
pub mod config;
pub mod interface;
pub mod motion;
pub mod pick;
pub mod pose;
pub mod servo;
pub mod sim;
pub mod stop;
pub mod vision;
