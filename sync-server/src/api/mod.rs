//! HTTP API 模块
//!
//! 用户和订单路由由各自服务提供，这里只包含宿主进程自己的路由。

pub mod health;
