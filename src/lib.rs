pub mod config;
pub mod line_protocol;
pub mod monitor;
pub mod parser;
pub mod pipeline;
pub mod sink;
pub mod tailer;
