//! Dispatcher resilience and controller lifecycle.

use std::collections::HashSet;
use std::sync::mpsc;

use xfkey::{ControllerState, Direction, IkeCommand, IpsecProtocol, PolicySpec, Result};

use crate::common::{BACKENDS, Lab, Probe, esp, ip, net, next_command};

fn protect(lab: &Lab) -> Result<u32> {
    let spec = PolicySpec::protect(
        Direction::Out,
        vec![net("10.0.0.0", 24)],
        vec![net("10.1.0.0", 24)],
        IpsecProtocol::Esp,
    );
    Ok(lab.controller.create_ipsec_policy(&spec)?[0])
}

#[test]
fn malformed_message_does_not_stop_dispatch() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let id = protect(&lab)?;

        lab.kernel.inject(backend, &[0xff; 7]);
        lab.kernel.inject(backend, &[0u8; 64]);
        lab.kernel.acquire(id, &ip("10.0.0.1"), &ip("10.1.0.1"))?;

        match next_command(&rx) {
            Some(IkeCommand::StartNegotiation { policy_id, .. }) => assert_eq!(policy_id, id),
            other => panic!("{backend}: unexpected {:?}", other),
        }
        assert_eq!(lab.controller.state(), ControllerState::Running);
    }
    Ok(())
}

#[test]
fn broken_listener_is_reopened() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let id = protect(&lab)?;
        assert!(lab.wait_listeners(1));

        lab.kernel.disconnect_listeners();
        assert!(lab.wait_listeners(1), "{backend}: listener not reopened");

        lab.kernel.acquire(id, &ip("10.0.0.1"), &ip("10.1.0.1"))?;
        assert!(
            matches!(next_command(&rx), Some(IkeCommand::StartNegotiation { .. })),
            "{backend}"
        );
    }
    Ok(())
}

#[test]
fn controller_stops_and_restarts() -> Result<()> {
    for backend in BACKENDS {
        let (lab, _rx) = Lab::started(backend)?;
        assert_eq!(lab.controller.state(), ControllerState::Running);

        let (tx, _) = mpsc::channel();
        assert!(lab.controller.start(Probe(tx)).unwrap_err().is_configuration());

        lab.controller.exit();
        assert_eq!(lab.controller.state(), ControllerState::Stopping);
        lab.controller.join();
        assert_eq!(lab.controller.state(), ControllerState::Stopped);
        assert!(lab.wait_listeners(0), "{backend}: listener still open");

        // Synchronous requests keep working without a dispatcher.
        let id = protect(&lab)?;
        assert!(lab.controller.get_policy_by_id(id).is_ok());

        let (tx, rx) = mpsc::channel();
        lab.controller.start(Probe(tx))?;
        lab.kernel.acquire(id, &ip("10.0.0.1"), &ip("10.1.0.1"))?;
        assert!(matches!(next_command(&rx), Some(IkeCommand::StartNegotiation { .. })));
    }
    Ok(())
}

#[test]
fn request_sequence_numbers_are_unique() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (a, b) = (ip("192.0.2.1"), ip("192.0.2.2"));
        for _ in 0..3 {
            lab.controller.get_spi(&a, &b, IpsecProtocol::Esp)?;
        }
        lab.controller.create_ipsec_sa(&b, &a, &esp(0x7000))?;
        protect(&lab)?;
        lab.controller.update_policies(false)?;
        lab.controller.flush_ipsec_policies()?;

        let sequences = lab.kernel.sequences();
        let unique: HashSet<_> = sequences.iter().collect();
        assert!(sequences.len() >= 7, "{backend}: {:?}", sequences);
        assert_eq!(unique.len(), sequences.len(), "{backend}: {:?}", sequences);
    }
    Ok(())
}

#[test]
fn concurrent_requests_each_get_their_reply() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let spis: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let controller = &lab.controller;
                    s.spawn(move || {
                        let dst = ip(&format!("192.0.2.{}", 10 + i));
                        controller.get_spi(&ip("198.51.100.1"), &dst, IpsecProtocol::Esp)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Result<_>>()
        })?;
        assert_eq!(spis.len(), 4);
        assert_eq!(lab.kernel.sa_count(), 4, "{backend}");
        assert_eq!(lab.controller.lifecycle().len(), 4);
    }
    Ok(())
}
