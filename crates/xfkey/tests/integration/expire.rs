//! EXPIRE handling: soft expiry asks for a rekey, hard expiry tears the
//! Child SA down.

use xfkey::{IkeCommand, IpsecProtocol, Result, SaId};

use crate::common::{BACKENDS, Lab, esp, ip, next_command};

#[test]
fn soft_expire_requests_rekey() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let (remote, local) = (ip("198.51.100.1"), ip("192.0.2.1"));
        let spi = lab.controller.get_spi(&remote, &local, IpsecProtocol::Esp)?;
        lab.controller.create_ipsec_sa(&remote, &local, &esp(spi).reqid(3))?;
        let sa = SaId::new(remote, local, IpsecProtocol::Esp, spi);

        lab.kernel.expire(&sa, false)?;
        assert_eq!(
            next_command(&rx),
            Some(IkeCommand::RekeyChildSa { sa, reqid: 3 }),
            "{backend}"
        );
        // Soft expiry leaves the SA in place.
        assert!(lab.kernel.sa(&sa).is_some());
        assert!(lab.controller.lifecycle().state(&sa).is_some());
    }
    Ok(())
}

#[test]
fn hard_expire_deletes_child_sa() -> Result<()> {
    for backend in BACKENDS {
        let (lab, rx) = Lab::started(backend)?;
        let (local, remote) = (ip("192.0.2.1"), ip("198.51.100.1"));
        lab.controller.create_ipsec_sa(&local, &remote, &esp(0x5000).reqid(4))?;
        let sa = SaId::new(local, remote, IpsecProtocol::Esp, 0x5000);

        lab.kernel.expire(&sa, true)?;
        assert_eq!(
            next_command(&rx),
            Some(IkeCommand::DeleteChildSa { sa, reqid: 4 }),
            "{backend}"
        );
        assert!(lab.kernel.sa(&sa).is_none());
        assert!(lab.controller.lifecycle().state(&sa).is_none());
    }
    Ok(())
}
