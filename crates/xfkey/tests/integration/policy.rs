//! Policy install, dump, delete, flush and selector narrowing.

use xfkey::model::SaRequest;
use xfkey::{
    Direction, IpsecLevel, IpsecMode, IpsecProtocol, Policy, PolicyAction, PolicySpec, PolicyType, Protocol, Result,
    TrafficSelector,
};

use crate::common::{BACKENDS, Lab, ip, net};

fn site_to_site() -> PolicySpec {
    PolicySpec::protect(
        Direction::Out,
        vec![net("10.0.0.0", 24)],
        vec![net("10.1.0.0", 16), net("10.2.0.0", 16)],
        IpsecProtocol::Esp,
    )
    .tunnel(ip("192.0.2.1"), ip("198.51.100.1"))
    .reqid(1)
}

#[test]
fn installed_policies_round_trip_through_dump() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let ids = lab.controller.create_ipsec_policy(&site_to_site())?;
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(lab.kernel.policies().len(), 2);
        assert_eq!(lab.controller.store().len(), 2);

        // Reload from the kernel: same entries, same ids, kernel order.
        let before = lab.controller.store().snapshot();
        assert_eq!(lab.controller.update_policies(false)?, 2);
        let after = lab.controller.store().snapshot();
        assert_eq!(after.len(), 2);
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.id, b.id, "{backend}");
            assert!(a.same_selector(b), "{backend}: {a} vs {b}");
            let endpoints = b.sa_request.as_ref().and_then(|r| r.tunnel_endpoints()).expect("tunnel lost");
            assert_eq!((endpoints.src, endpoints.dst), (ip("192.0.2.1"), ip("198.51.100.1")));
        }

        let policy = lab.controller.get_policy_by_id(ids[1])?;
        assert_eq!(policy.dst_traffic_selector(), net("10.2.0.0", 16));
        assert!(lab.controller.get_policy_by_id(0xffff).unwrap_err().is_consistency());
    }
    Ok(())
}

#[test]
fn print_shows_every_policy() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        lab.controller.create_ipsec_policy(&site_to_site())?;
        let text = lab.controller.print_policies();
        assert_eq!(text.matches("<POLICY>").count(), 2);
        assert!(text.contains("src_selector=10.0.0.0/24"));
        assert!(text.contains("dst_selector=10.2.0.0/16"));
    }
    Ok(())
}

#[test]
fn bypass_policy_carries_no_request() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let spec = PolicySpec::protect(
            Direction::In,
            vec![net("10.5.0.0", 16)],
            vec![net("10.6.0.0", 16)],
            IpsecProtocol::Esp,
        )
        .action(PolicyAction::Bypass);
        lab.controller.create_ipsec_policy(&spec)?;
        lab.controller.update_policies(false)?;
        let policies = lab.controller.store().snapshot();
        assert_eq!(policies.len(), 1);
        assert!(policies[0].sa_request.is_none(), "{backend}");
        assert_eq!(policies[0].direction, Direction::In);
    }
    Ok(())
}

#[test]
fn delete_removes_kernel_and_mirror_entries() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let spec = site_to_site();
        lab.controller.create_ipsec_policy(&spec)?;

        let removed = lab
            .controller
            .delete_ipsec_policy(&spec.src_selectors, &spec.dst_selectors[..1], Direction::Out)?;
        assert_eq!(removed, 1);
        assert_eq!(lab.kernel.policies().len(), 1);
        assert_eq!(lab.controller.store().len(), 1);

        let err = lab
            .controller
            .delete_ipsec_policy(&spec.src_selectors, &spec.dst_selectors[..1], Direction::Out)
            .unwrap_err();
        assert!(err.is_not_found(), "{backend}: {err}");
        assert_eq!(lab.controller.store().len(), 1);
    }
    Ok(())
}

#[test]
fn duplicate_install_is_rejected() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let spec = PolicySpec::protect(
            Direction::Out,
            vec![net("10.0.0.0", 24)],
            vec![net("10.1.0.0", 24)],
            IpsecProtocol::Esp,
        );
        lab.controller.create_ipsec_policy(&spec)?;
        let err = lab.controller.create_ipsec_policy(&spec).unwrap_err();
        assert!(err.is_already_exists(), "{backend}: {err}");
        assert_eq!(lab.controller.store().len(), 1);
    }
    Ok(())
}

#[test]
fn kernel_failure_leaves_mirror_untouched() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        lab.kernel.fail_next(libc::ENOBUFS);
        let err = lab.controller.create_ipsec_policy(&site_to_site()).unwrap_err();
        assert!(err.is_kernel_rejection());
        assert_eq!(err.errno(), Some(libc::ENOBUFS));
        assert!(lab.controller.store().is_empty());
        assert!(lab.kernel.policies().is_empty());
    }
    Ok(())
}

#[test]
fn failed_batch_removes_policies_already_installed() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        // XFRM reads each new policy back with GETPOLICY.
        let per_policy = if backend == Protocol::Xfrm { 2 } else { 1 };
        lab.kernel.fail_after(per_policy, libc::ENOBUFS);
        let err = lab.controller.create_ipsec_policy(&site_to_site()).unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOBUFS), "{backend}");
        assert!(lab.kernel.policies().is_empty(), "{backend}: first policy left behind");
        assert!(lab.controller.store().is_empty());
    }
    Ok(())
}

#[test]
fn lookup_miss_reloads_mirror_once() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let policy = Policy::new(Direction::In, (ip("10.4.0.0"), 24), (ip("10.5.0.0"), 24))
            .with_request(SaRequest::transport(IpsecProtocol::Esp, IpsecLevel::Require, 0));
        let id = lab.kernel.install_policy(policy)?;
        assert!(lab.controller.store().is_empty());

        let found = lab.controller.get_policy_by_id(id)?;
        assert_eq!(found.direction, Direction::In, "{backend}");
        assert_eq!(lab.controller.store().len(), 1);
    }
    Ok(())
}

#[test]
fn flush_clears_sub_policy_table() -> Result<()> {
    let lab = Lab::new(Protocol::Xfrm)?;
    lab.controller.create_ipsec_policy(&site_to_site())?;
    lab.controller.create_ipsec_policy(&site_to_site().sub(true))?;
    let kernel = lab.kernel.policies();
    assert_eq!(kernel.len(), 4);
    assert_eq!(kernel.iter().filter(|p| p.policy_type == PolicyType::Sub).count(), 2);

    lab.controller.flush_ipsec_policies()?;
    assert!(lab.kernel.policies().is_empty());
    assert!(lab.controller.store().is_empty());
    Ok(())
}

#[test]
fn flush_empties_kernel_and_mirror() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        lab.controller.create_ipsec_policy(&site_to_site())?;
        lab.controller.flush_ipsec_policies()?;
        assert!(lab.kernel.policies().is_empty());
        assert!(lab.controller.store().is_empty());
        assert_eq!(lab.controller.update_policies(false)?, 0, "{backend}");
    }
    Ok(())
}

#[test]
fn tunnel_endpoint_change_rewrites_policies() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let ids = lab.controller.create_ipsec_policy(&site_to_site())?;
        let moved = lab
            .controller
            .update_ipsec_policy_addresses(&ip("192.0.2.1"), &ip("192.0.2.77"))?;
        assert_eq!(moved, 2);
        for policy in lab.kernel.policies() {
            assert!(ids.contains(&policy.id), "{backend}: id changed");
            let t = policy.sa_request.as_ref().and_then(|r| r.tunnel_endpoints()).expect("tunnel lost");
            assert_eq!((t.src, t.dst), (ip("192.0.2.77"), ip("198.51.100.1")));
        }
        assert_eq!(lab.controller.store().len(), 2);
        assert_eq!(
            lab.controller
                .update_ipsec_policy_addresses(&ip("203.0.113.1"), &ip("203.0.113.2"))?,
            0
        );
    }
    Ok(())
}

#[test]
fn failed_rewrite_names_the_update_request() -> Result<()> {
    let lab = Lab::new(Protocol::Xfrm)?;
    lab.controller.create_ipsec_policy(&site_to_site())?;
    lab.kernel.fail_next(libc::ENOBUFS);
    let err = lab
        .controller
        .update_ipsec_policy_addresses(&ip("192.0.2.1"), &ip("192.0.2.77"))
        .unwrap_err();
    assert!(err.to_string().starts_with("XFRM_MSG_UPDPOLICY"), "{err}");
    Ok(())
}

#[test]
fn find_policy_matches_contained_selectors() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let ids = lab.controller.create_ipsec_policy(&site_to_site())?;
        let tunnel = Some((ip("192.0.2.1"), ip("198.51.100.1")));
        let found = lab.controller.find_policy(
            &net("10.0.0.0", 25),
            &net("10.2.3.0", 24),
            Direction::Out,
            IpsecMode::Tunnel,
            IpsecProtocol::Esp,
            tunnel,
        );
        assert_eq!(found.map(|p| p.id), Some(ids[1]));
        let wrong_gateway = lab.controller.find_policy(
            &net("10.0.0.0", 25),
            &net("10.2.3.0", 24),
            Direction::Out,
            IpsecMode::Tunnel,
            IpsecProtocol::Esp,
            Some((ip("192.0.2.1"), ip("198.51.100.2"))),
        );
        assert!(wrong_gateway.is_none());
    }
    Ok(())
}

#[test]
fn proposed_selectors_narrow_to_policy() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        lab.controller.create_ipsec_policy(&PolicySpec::protect(
            Direction::Out,
            vec![net("10.0.0.0", 24)],
            vec![net("10.1.0.0", 16)],
            IpsecProtocol::Esp,
        ))?;
        let any = TrafficSelector::any(ip("0.0.0.0"));

        let (ts_i, ts_r) = lab
            .controller
            .narrow_payload_ts(&net("10.0.0.0", 16), &any, IpsecMode::Transport, IpsecProtocol::Esp, None)
            .expect("no overlap");
        assert_eq!(ts_i, net("10.0.0.0", 24));
        assert_eq!(ts_r, net("10.1.0.0", 16));

        let (ts_i, _) = lab
            .controller
            .narrow_payload_ts(&any, &any, IpsecMode::Transport, IpsecProtocol::Esp, Some(ip("10.0.0.5")))
            .expect("no overlap");
        assert_eq!(ts_i, TrafficSelector::host(ip("10.0.0.5")));

        assert!(
            lab.controller
                .narrow_payload_ts(&net("172.16.0.0", 12), &any, IpsecMode::Transport, IpsecProtocol::Esp, None)
                .is_none()
        );
        assert!(
            lab.controller
                .narrow_payload_ts(&any, &any, IpsecMode::Tunnel, IpsecProtocol::Esp, None)
                .is_none(),
            "{backend}: mode ignored"
        );

        let host = TrafficSelector::host(ip("10.0.0.5"));
        assert!(lab.controller.check_narrow_payload_ts(
            &host,
            &net("10.1.2.0", 24),
            IpsecMode::Transport,
            IpsecProtocol::Esp
        ));
        assert!(!lab.controller.check_narrow_payload_ts(
            &host,
            &net("10.9.0.0", 24),
            IpsecMode::Transport,
            IpsecProtocol::Esp
        ));
        assert!(!lab.controller.check_narrow_payload_ts(
            &host,
            &net("10.1.2.0", 24),
            IpsecMode::Transport,
            IpsecProtocol::Ah
        ));
    }
    Ok(())
}
