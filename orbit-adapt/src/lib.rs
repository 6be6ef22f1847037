pub mod blockchain;
pub mod dns;
pub mod ingress;
pub mod node_agent;

pub use blockchain::{BlockchainClient, MockBlockchainClient};
pub use dns::{DomainVerifier, HickoryDomainVerifier, MockDomainVerifier};
pub use ingress::{IngressConfigApplier, IngressRoute, MockIngressConfigApplier};
pub use node_agent::{HttpNodeAgentClient, MockNodeAgentClient, NodeAgentClient};
