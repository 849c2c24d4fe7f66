//! ACQUIRE handling: a packet hits a policy without an SA and the IKE side
//! is asked to negotiate one.

use xfkey::model::SaRequest;
use xfkey::{Direction, IkeCommand, IpsecLevel, IpsecMode, IpsecProtocol, Policy, PolicySpec, Result};

use crate::common::{BACKENDS, Lab, Seen, WAIT, ip, net, next_command};

#[test]
fn acquire_on_tunnel_policy_starts_negotiation() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let spec = PolicySpec::protect(
            Direction::Out,
            vec![net("10.0.0.0", 24)],
            vec![net("10.1.0.0", 16)],
            IpsecProtocol::Esp,
        )
        .tunnel(ip("192.0.2.1"), ip("198.51.100.1"))
        .reqid(5);
        let ids = lab.controller.create_ipsec_policy(&spec)?;
        assert_eq!(ids.len(), 1);

        lab.kernel.acquire(ids[0], &ip("10.0.0.7"), &ip("10.1.2.3"))?;

        let command = next_command(&rx).expect("no command after acquire");
        assert_eq!(
            command,
            IkeCommand::StartNegotiation {
                policy_id: ids[0],
                ts_i: net("10.0.0.0", 24),
                ts_r: net("10.1.0.0", 16),
                tunnel: Some((ip("192.0.2.1"), ip("198.51.100.1"))),
                mode: IpsecMode::Tunnel,
                protocol: IpsecProtocol::Esp,
                reqid: 5,
            },
            "{backend}"
        );
    }
    Ok(())
}

#[test]
fn acquire_on_transport_policy_has_no_tunnel() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let spec = PolicySpec::protect(
            Direction::Out,
            vec![net("192.0.2.10", 32)],
            vec![net("192.0.2.20", 32)],
            IpsecProtocol::Esp,
        );
        let ids = lab.controller.create_ipsec_policy(&spec)?;
        lab.kernel.acquire(ids[0], &ip("192.0.2.10"), &ip("192.0.2.20"))?;

        match next_command(&rx) {
            Some(IkeCommand::StartNegotiation {
                policy_id, tunnel, mode, ..
            }) => {
                assert_eq!(policy_id, ids[0]);
                assert_eq!(tunnel, None);
                assert_eq!(mode, IpsecMode::Transport);
            }
            other => panic!("{backend}: unexpected {:?}", other),
        }
    }
    Ok(())
}

#[test]
fn acquire_for_policy_installed_elsewhere_refreshes_mirror() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        assert!(lab.controller.store().is_empty());

        // Installed by another key manager after the controller loaded
        // the table.
        let policy = Policy::new(Direction::Out, (ip("10.2.0.0"), 24), (ip("10.3.0.0"), 24))
            .with_request(SaRequest::transport(IpsecProtocol::Esp, IpsecLevel::Require, 0));
        let id = lab.kernel.install_policy(policy)?;
        lab.kernel.acquire(id, &ip("10.2.0.1"), &ip("10.3.0.1"))?;

        match next_command(&rx) {
            Some(IkeCommand::StartNegotiation {
                policy_id, ts_i, ts_r, protocol, ..
            }) => {
                assert_eq!(policy_id, id);
                assert_eq!(ts_i, net("10.2.0.0", 24));
                assert_eq!(ts_r, net("10.3.0.0", 24));
                assert_eq!(protocol, IpsecProtocol::Esp);
            }
            other => panic!("{backend}: unexpected {:?}", other),
        }
        assert_eq!(lab.controller.store().len(), 1);
    }
    Ok(())
}

#[test]
fn acquire_for_unknown_policy_is_reported() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let mut ghost = Policy::new(Direction::Out, (ip("10.9.0.0"), 24), (ip("10.8.0.0"), 24))
            .with_request(SaRequest::transport(IpsecProtocol::Esp, IpsecLevel::Require, 0));
        ghost.id = 999;
        lab.kernel.acquire_for(&ghost, &ip("10.9.0.1"), &ip("10.8.0.1"));

        match rx.recv_timeout(WAIT) {
            Ok(Seen::NoPolicy(acquire)) => assert_eq!(acquire.policy_id, Some(999)),
            other => panic!("{backend}: unexpected {:?}", other),
        }
    }
    Ok(())
}
