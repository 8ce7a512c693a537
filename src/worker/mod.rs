// Worker side: launching, signalling and reading the external downloader.

pub mod command;
pub mod output;
pub mod process;
pub mod traits;
