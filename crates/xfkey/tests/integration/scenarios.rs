//! The four reference scenarios, run on both kernel interfaces.

use std::time::Duration;

use xfkey::{
    ChildSaParams, Direction, EncryptionAlgorithm, IkeCommand, IntegrityAlgorithm, IpsecProtocol, PolicySpec,
    Result, SaId,
};

use crate::common::{BACKENDS, Lab, Seen, ip, net, next_command};

#[test]
fn spi_then_aes_cbc_sha1_sa() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));
        let spi = lab.controller.get_spi(&src, &dst, IpsecProtocol::Esp)?;
        assert_ne!(spi, 0);

        let params = ChildSaParams::esp(spi)
            .encryption(EncryptionAlgorithm::AesCbc, vec![0xa5; 16])
            .integrity(IntegrityAlgorithm::HmacSha1_96, vec![0x5a; 20]);
        lab.controller.create_ipsec_sa(&src, &dst, &params)?;

        let installed = lab
            .kernel
            .sa(&SaId::new(src, dst, IpsecProtocol::Esp, spi))
            .expect("SA missing");
        let auth = installed.integrity.expect("no integrity");
        assert_eq!(auth.algorithm, IntegrityAlgorithm::HmacSha1_96, "{backend}");
        assert_eq!(auth.key, vec![0x5a; 20]);
    }
    Ok(())
}

#[test]
fn tunnel_policy_dump_reads_back() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        let spec = PolicySpec::protect(
            Direction::Out,
            vec![net("10.0.0.0", 24)],
            vec![net("10.0.1.0", 24)],
            IpsecProtocol::Esp,
        )
        .tunnel(ip("192.0.2.1"), ip("192.0.2.2"));
        let id = lab.controller.create_ipsec_policy(&spec)?[0];

        lab.controller.update_policies(false)?;
        let dump = lab.controller.get_policy_by_id(id)?.to_string_tab(0);
        assert!(dump.contains("direction=OUT"), "{backend}: {dump}");
        assert!(dump.contains("src_selector=10.0.0.0/24"));
        assert!(dump.contains("dst_selector=10.0.1.0/24"));
    }
    Ok(())
}

#[test]
fn hard_expire_deletes_exactly_once() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));
        let spi = lab.controller.get_spi(&src, &dst, IpsecProtocol::Esp)?;
        lab.controller.create_ipsec_sa(&src, &dst, &crate::common::esp(spi))?;
        let sa = SaId::new(src, dst, IpsecProtocol::Esp, spi);

        lab.kernel.expire(&sa, true)?;
        assert!(matches!(
            next_command(&rx),
            Some(IkeCommand::DeleteChildSa { sa: got, .. }) if got == sa
        ));
        match rx.recv_timeout(Duration::from_millis(100)) {
            Err(_) => {}
            Ok(Seen::Command(extra)) => panic!("{backend}: unexpected {:?}", extra),
            Ok(Seen::NoPolicy(acquire)) => panic!("{backend}: unexpected {:?}", acquire),
        }
    }
    Ok(())
}

#[test]
fn deleting_missing_sa_keeps_policies() -> Result<()> {
    for backend in BACKENDS {
        let lab = Lab::new(backend)?;
        lab.controller.create_ipsec_policy(&PolicySpec::protect(
            Direction::Out,
            vec![net("10.0.0.0", 24)],
            vec![net("10.0.1.0", 24)],
            IpsecProtocol::Esp,
        ))?;
        let before = lab.controller.store().snapshot();

        let err = lab
            .controller
            .delete_ipsec_sa(&ip("10.0.0.1"), &ip("10.0.0.2"), IpsecProtocol::Esp, 0x0bad_cafe)
            .unwrap_err();
        assert!(err.is_kernel_rejection(), "{backend}: {err}");
        assert_eq!(lab.controller.store().snapshot(), before);
    }
    Ok(())
}
