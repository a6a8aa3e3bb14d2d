pub mod replication {
    pub mod v1 {
        tonic::include_proto!("edgeplace.replication.v1");

        pub use replication_client::ReplicationClient;
        pub use replication_server::{Replication, ReplicationServer};
    }
}
