pub mod traffic_queries;
