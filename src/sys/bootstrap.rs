// src/sys/bootstrap.rs

use crate::sys::secrets::Credential;

/// File the bootstrap script writes last; its content is `READY_TOKEN`.
pub const READY_MARKER: &str = "/root/setup_complete";
pub const READY_TOKEN: &str = "SUCCESS";

pub const WG_DIR: &str = "/etc/wireguard";
pub const WG_INTERFACE: &str = "wg0";

/// Server-side overlay address; peers are drawn from the rest of the /24.
pub const SERVER_OVERLAY_ADDRESS: &str = "10.0.0.1/24";

/// Renders the unattended setup script delivered as instance user-data.
///
/// The script installs WireGuard, sets the one-time root password used for
/// the bootstrap-phase SSH session, generates the server keypair, writes a
/// NAT-enabled `wg0.conf`, starts `wg-quick@wg0`, and finally writes the
/// readiness marker that `provisioning` polls for.
pub fn render_user_data(setup_password: &Credential, listen_port: u16) -> String {
    setup_password.use_secret(|password| {
        format!(
            r#"#!/bin/bash
exec > >(tee /var/log/user-data.log)
exec 2>&1
date

export DEBIAN_FRONTEND=noninteractive
apt-get update
apt-get install -y wireguard wireguard-tools iptables

echo 'root:{password}' | chpasswd
sed -i 's/^#\?PasswordAuthentication .*/PasswordAuthentication yes/' /etc/ssh/sshd_config
sed -i 's/^#\?PermitRootLogin .*/PermitRootLogin yes/' /etc/ssh/sshd_config
systemctl restart ssh || systemctl restart sshd

mkdir -p {wg_dir}/clients
chmod 700 {wg_dir} {wg_dir}/clients
cd {wg_dir}
umask 077
wg genkey | tee server_private.key | wg pubkey > server_public.key

SERVER_PRIVATE_KEY=$(cat server_private.key)
UPLINK=$(ip -4 route show default | awk '{{print $5}}' | head -n1)

cat > {iface}.conf << EOF
[Interface]
PrivateKey = $SERVER_PRIVATE_KEY
Address = {server_addr}
ListenPort = {port}
PostUp = iptables -A FORWARD -i %i -j ACCEPT; iptables -A FORWARD -o %i -j ACCEPT; iptables -t nat -A POSTROUTING -o $UPLINK -j MASQUERADE
PostDown = iptables -D FORWARD -i %i -j ACCEPT; iptables -D FORWARD -o %i -j ACCEPT; iptables -t nat -D POSTROUTING -o $UPLINK -j MASQUERADE
EOF

echo 'net.ipv4.ip_forward=1' > /etc/sysctl.d/99-wgpool.conf
sysctl --system

systemctl enable wg-quick@{iface}
systemctl start wg-quick@{iface}

echo "{token}" > {marker}
date
"#,
            password = password,
            wg_dir = WG_DIR,
            iface = WG_INTERFACE,
            server_addr = SERVER_OVERLAY_ADDRESS,
            port = listen_port,
            token = READY_TOKEN,
            marker = READY_MARKER,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_embeds_password_port_and_marker() {
        let cred = Credential::new("Abc123Xyz789Qwe0".into());
        let script = render_user_data(&cred, 51820);
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("echo 'root:Abc123Xyz789Qwe0' | chpasswd"));
        assert!(script.contains("ListenPort = 51820"));
        assert!(script.contains("echo \"SUCCESS\" > /root/setup_complete"));
        assert!(script.contains("systemctl start wg-quick@wg0"));
    }

    #[test]
    fn marker_is_written_last() {
        let script = render_user_data(&Credential::new("p".into()), 51820);
        let start = script.find("systemctl start wg-quick@wg0").unwrap();
        let marker = script.find(READY_MARKER).unwrap();
        assert!(marker > start);
    }
}
