pub mod alert_service;
pub mod machine_service;
pub mod notification_service;
