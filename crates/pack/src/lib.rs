pub mod package;
pub mod workload;

pub use package::Package;
pub use workload::PackageWorkload;
