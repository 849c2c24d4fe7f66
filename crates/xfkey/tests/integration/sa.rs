//! SPI reservation and the larval to mature SA lifecycle.

use xfkey::lifecycle::SaState;
use xfkey::{EncryptionAlgorithm, IpsecProtocol, Result, SaId};

use crate::common::{BACKENDS, Lab, esp, ip};

#[test]
fn reserved_spi_is_promoted_by_create() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (remote, local) = (ip("198.51.100.1"), ip("192.0.2.1"));

        let spi = lab.controller.get_spi(&remote, &local, IpsecProtocol::Esp)?;
        let (min, max) = lab.controller.config().spi_range;
        assert!((min..=max).contains(&spi), "{backend}: spi {spi:#x} out of range");

        let id = SaId::new(remote, local, IpsecProtocol::Esp, spi);
        assert!(lab.kernel.is_larval(&id));
        assert_eq!(lab.controller.lifecycle().state(&id), Some(SaState::Larval));

        lab.controller.create_ipsec_sa(&remote, &local, &esp(spi).reqid(7))?;
        assert!(!lab.kernel.is_larval(&id));
        let params = lab.kernel.sa(&id).expect("SA not installed");
        assert_eq!(params.reqid, 7);
        let enc = params.encryption.expect("no encryption");
        assert_eq!(enc.algorithm, EncryptionAlgorithm::AesCbc);
        assert_eq!(enc.key, vec![0x11; 16]);
        assert_eq!(lab.kernel.sa_count(), 1, "{backend}: larval SA left behind");
        assert_eq!(lab.controller.lifecycle().state(&id), Some(SaState::Mature));

        assert_eq!(lab.controller.delete_ipsec_sa(&remote, &local, IpsecProtocol::Esp, spi)?, spi);
        assert_eq!(lab.kernel.sa_count(), 0);
        assert!(lab.controller.lifecycle().is_empty());
    }
    Ok(())
}

#[test]
fn consecutive_reservations_differ() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (remote, local) = (ip("198.51.100.1"), ip("192.0.2.1"));
        let a = lab.controller.get_spi(&remote, &local, IpsecProtocol::Esp)?;
        let b = lab.controller.get_spi(&remote, &local, IpsecProtocol::Esp)?;
        assert_ne!(a, b);
        assert_eq!(lab.kernel.sa_count(), 2);
    }
    Ok(())
}

#[test]
fn create_with_known_spi_adds() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (local, remote) = (ip("192.0.2.1"), ip("198.51.100.1"));
        lab.controller.create_ipsec_sa(&local, &remote, &esp(0x1234))?;
        let id = SaId::new(local, remote, IpsecProtocol::Esp, 0x1234);
        assert!(lab.kernel.sa(&id).is_some());
        assert_eq!(lab.controller.lifecycle().state(&id), Some(SaState::Mature));
    }
    Ok(())
}

#[test]
fn invalid_parameters_never_reach_the_kernel() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let params = xfkey::ChildSaParams::esp(0x2000).encryption(EncryptionAlgorithm::AesCbc, vec![0; 16]);
        let err = lab
            .controller
            .create_ipsec_sa(&ip("192.0.2.1"), &ip("192.0.2.2"), &params)
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(lab.kernel.sequences().is_empty());
    }
    Ok(())
}

#[test]
fn deleting_unknown_sa_is_not_found() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let err = lab
            .controller
            .delete_ipsec_sa(&ip("192.0.2.1"), &ip("192.0.2.2"), IpsecProtocol::Esp, 0xdead)
            .unwrap_err();
        assert!(err.is_not_found(), "{backend}: {err}");
        assert!(err.is_kernel_rejection());
    }
    Ok(())
}

#[test]
fn address_change_moves_sas() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (remote, old, new) = (ip("198.51.100.1"), ip("192.0.2.1"), ip("192.0.2.99"));
        lab.controller.create_ipsec_sa(&remote, &old, &esp(0x3000))?;
        lab.controller.create_ipsec_sa(&old, &remote, &esp(0x3001))?;
        lab.controller.create_ipsec_sa(&remote, &ip("203.0.113.5"), &esp(0x3002))?;

        assert_eq!(lab.controller.update_ipsec_sa_addresses(&old, &new)?, 2);
        assert!(lab.kernel.sa(&SaId::new(remote, new, IpsecProtocol::Esp, 0x3000)).is_some());
        assert!(lab.kernel.sa(&SaId::new(new, remote, IpsecProtocol::Esp, 0x3001)).is_some());
        assert!(lab.kernel.sa(&SaId::new(remote, old, IpsecProtocol::Esp, 0x3000)).is_none());
        assert_eq!(lab.kernel.sa_count(), 3);
    }
    Ok(())
}

#[test]
fn source_move_keeps_sa_when_readd_fails() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (remote, old, new) = (ip("198.51.100.1"), ip("192.0.2.1"), ip("192.0.2.99"));
        let outbound = SaId::new(old, remote, IpsecProtocol::Esp, 0x3101);
        lab.controller.create_ipsec_sa(&old, &remote, &esp(0x3101))?;

        // The delete goes through, the re-add with the new source fails.
        lab.kernel.fail_after(1, libc::ENOBUFS);
        let err = lab.controller.update_ipsec_sa_addresses(&old, &new).unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOBUFS), "{backend}");
        assert!(lab.kernel.sa(&outbound).is_some(), "{backend}: SA not restored");
        assert_eq!(lab.kernel.sa_count(), 1);
        assert_eq!(lab.controller.lifecycle().state(&outbound), Some(SaState::Mature));
    }
    Ok(())
}

#[test]
fn flush_removes_every_sa() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (a, b) = (ip("192.0.2.1"), ip("192.0.2.2"));
        lab.controller.get_spi(&a, &b, IpsecProtocol::Esp)?;
        lab.controller.create_ipsec_sa(&b, &a, &esp(0x4000))?;
        lab.controller.flush_ipsec_sas()?;
        assert_eq!(lab.kernel.sa_count(), 0);
        assert!(lab.controller.lifecycle().is_empty());
    }
    Ok(())
}
