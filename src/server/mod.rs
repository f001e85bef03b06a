pub mod master;
pub mod plugin;
pub mod protocol;
pub mod worker;
