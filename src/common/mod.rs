pub mod client {
    pub mod models {
        pub mod transfer;
    }
    pub mod client;
    pub mod error;
}

pub mod logger;
