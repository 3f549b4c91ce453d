use macaddr::MacAddr6;
// Random
use rand::Rng;

// Error Handling
use vmplane_error::{LibError, VmplaneError};

/// Locally administered prefix used by qemu/kvm guests.
const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

pub fn random_mac() -> MacAddr6 {
    let mut rng = rand::rng();
    MacAddr6::new(
        MAC_PREFIX[0],
        MAC_PREFIX[1],
        MAC_PREFIX[2],
        rng.random(),
        rng.random(),
        rng.random(),
    )
}

/*
* Generate a mac address not present in `taken`.
*/
pub fn unique_mac(taken: &[MacAddr6]) -> Result<MacAddr6, VmplaneError> {
    for _ in 0..64 {
        let mac = random_mac();
        if !taken.contains(&mac) {
            return Ok(mac);
        }
    }
    Err(LibError::builder()
        .msg("Couldn't generate a unique mac address")
        .help("too many interfaces on this vm")
        .build()
        .into())
}

#[cfg(test)]
mod test {
    use super::*;

    // Error Handling
    use miette::Result;

    #[test]
    fn gen_random_mac() -> Result<()> {
        for _ in 0..5 {
            let mac = random_mac();
            println!("{}", mac);
            assert_eq!(mac.to_string().len(), 17);
            assert_eq!(&mac.as_bytes()[..3], &MAC_PREFIX);
        }
        Ok(())
    }

    #[test]
    fn gen_unique_mac() -> Result<()> {
        let mut taken = vec![];
        for _ in 0..32 {
            let mac = unique_mac(&taken)?;
            assert!(!taken.contains(&mac));
            taken.push(mac);
        }
        Ok(())
    }
}
