use std::collections::BTreeMap;
use std::env;

use log::{info, warn};
use svcdir_client::{
    AnnounceRequest, ClientConfig, DiscoveryEvent, ResultCode, ServiceIterator,
    create_discovery_client,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 配置文件可选，缺省时使用默认值
    let config = match env::args().nth(1) {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };

    let client = create_discovery_client(config)?;
    let mut events = client.subscribe();

    info!("Client status: {:?}", client.status());

    // 注册本机实例
    let mut metadata = BTreeMap::new();
    metadata.insert("zone".to_string(), "demo".to_string());
    let request = AnnounceRequest {
        metadata,
        ..AnnounceRequest::new(
            "demo-service",
            "1.0.0",
            "0.0.0.0",
            8080,
            "http://localhost:8080/status",
        )
    };

    match client.announce(&request) {
        Ok(record) => info!("Announced {} via {}", record.key, record.served_by),
        Err(e) => warn!("Announce failed ({}): {}", e.code(), e),
    }

    // 解析服务成员
    let mut candidates = client.open("demo-service")?;
    loop {
        match candidates.next_item() {
            Ok(Some(candidate)) => info!("Candidate #{}: {}", candidates.cursor(), candidate),
            Ok(None) => break,
            Err(e) => {
                warn!("Resolution failed ({}): {}", e.code(), e);
                break;
            }
        }
    }
    candidates.close();

    // 注销所有实例
    for (key, outcome) in client.deannounce_all() {
        info!("Deannounce {}: {}", key, ResultCode::of(&outcome));
    }

    while let Ok(event) = events.try_recv() {
        match event {
            DiscoveryEvent::Announced(record) => info!("Event: announced {}", record.key),
            DiscoveryEvent::Deannounced(key) => info!("Event: deannounced {}", key),
            DiscoveryEvent::DirectoryDisabled => warn!("Event: discovery disabled"),
            DiscoveryEvent::DirectoryReenabled => info!("Event: discovery re-enabled"),
        }
    }

    info!("示例程序已结束");
    Ok(())
}
