// CipherKind::from_str 是固有方法，不走 FromStr
#![allow(clippy::should_implement_trait)]

pub mod app;
pub mod common;
pub mod config;
pub mod proxy;
