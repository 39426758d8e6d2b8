// 🛡️ Outside-world adapters: everything that talks to a cloud API or a remote
// shell lives here, behind the contracts in `traits`.

pub mod traits;     // Global contracts
pub mod secrets;    // Memory hygiene (Credential)
pub mod ssh;        // Remote execution over OpenSSH
pub mod provider;   // Vultr / DigitalOcean / static host
pub mod bootstrap;  // Cloud-init payload
