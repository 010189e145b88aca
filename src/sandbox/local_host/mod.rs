pub mod fs_jail;
pub mod process_supervisor;

pub use fs_jail::FsJail;
pub use process_supervisor::{CommandSpec, ProcessSupervisor};
