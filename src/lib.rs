pub mod api;
pub mod auth;
pub mod campaigns;
pub mod config;
pub mod fees;
pub mod links;
pub mod live;
pub mod referrals;
pub mod risk;
pub mod service;
pub mod shares;
pub mod storage;
pub mod wallets;
