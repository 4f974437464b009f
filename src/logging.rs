use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use peermesh_core::{LogConfig, LogTo, MeshResult};

/// 初始化日志订阅器
///
/// 文件模式下日志落到以群组起始端口命名的文件里；`RUST_LOG` 环境
/// 变量优先于配置的级别。
pub fn init(config: &LogConfig, starting_port: u16) -> MeshResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.log_to {
        LogTo::Stdout => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogTo::File => {
            std::fs::create_dir_all(&config.dir)?;
            let path = format!("{}/peermesh-{starting_port}.log", config.dir);
            let file = Arc::new(File::create(&path)?);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(move || Arc::clone(&file))
                .with_ansi(false)
                .init();
        }
        LogTo::None => {}
    }
    Ok(())
}
