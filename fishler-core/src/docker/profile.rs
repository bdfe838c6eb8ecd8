use std::io;

use tar::{Builder, Header};

const BASE_PASSWD: &str = "root:x:0:0:root:/root:/bin/ash
bin:x:1:1:bin:/bin:/sbin/nologin
daemon:x:2:2:daemon:/sbin:/sbin/nologin
adm:x:3:4:adm:/var/adm:/sbin/nologin
lp:x:4:7:lp:/var/spool/lpd:/sbin/nologin
sync:x:5:0:sync:/sbin:/bin/sync
shutdown:x:6:0:shutdown:/sbin:/sbin/shutdown
halt:x:7:0:halt:/sbin:/sbin/halt
mail:x:8:12:mail:/var/mail:/sbin/nologin
news:x:9:13:news:/usr/lib/news:/sbin/nologin
uucp:x:10:14:uucp:/var/spool/uucppublic:/sbin/nologin
operator:x:11:0:operator:/root:/sbin/nologin
man:x:13:15:man:/usr/man:/sbin/nologin
postmaster:x:14:12:postmaster:/var/mail:/sbin/nologin
cron:x:16:16:cron:/var/spool/cron:/sbin/nologin
ftp:x:21:21::/var/lib/ftp:/sbin/nologin
sshd:x:22:22:sshd:/dev/null:/sbin/nologin
at:x:25:25:at:/var/spool/cron/atjobs:/sbin/nologin
squid:x:31:31:Squid:/var/cache/squid:/sbin/nologin
xfs:x:33:33:X Font Server:/etc/X11/fs:/sbin/nologin
games:x:35:35:games:/usr/games:/sbin/nologin
cyrus:x:85:12::/usr/cyrus:/sbin/nologin
vpopmail:x:89:89::/var/vpopmail:/sbin/nologin
ntp:x:123:123:NTP:/var/empty:/sbin/nologin
smmsp:x:209:209:smmsp:/var/spool/mqueue:/sbin/nologin
guest:x:405:100:guest:/dev/null:/sbin/nologin
nobody:x:65534:65534:nobody:/:/sbin/nologin
";

const BASE_GROUP: &str = "root:x:0:root
bin:x:1:root,bin,daemon
daemon:x:2:root,bin,daemon
sys:x:3:root,bin,adm
adm:x:4:root,adm,daemon
tty:x:5:
disk:x:6:root,adm
lp:x:7:lp
mem:x:8:
kmem:x:9:
wheel:x:10:root
floppy:x:11:root
mail:x:12:mail
news:x:13:news
uucp:x:14:uucp
man:x:15:man
cron:x:16:cron
console:x:17:
audio:x:18:
cdrom:x:19:
dialout:x:20:root
ftp:x:21:
sshd:x:22:
input:x:23:
at:x:25:at
tape:x:26:root
video:x:27:root
netdev:x:28:
readproc:x:30:
squid:x:31:squid
xfs:x:33:xfs
kvm:x:34:kvm
games:x:35:
shadow:x:42:
cdrw:x:80:
www-data:x:82:
usb:x:85:
vpopmail:x:89:
users:x:100:games
ntp:x:123:
nofiles:x:200:
smmsp:x:209:smmsp
locate:x:245:
abuild:x:300:
utmp:x:406:
ping:x:999:
nogroup:x:65533:
nobody:x:65534:
";

/// Synthesizes the `/etc/passwd` and `/etc/group` pair seeded into each
/// sandbox, returned as a tar stream. Non-root identities get a uid 1000
/// account with `/bin/ash` on top of the stock Alpine entries.
pub fn profile_tar(username: &str) -> io::Result<Vec<u8>> {
    let mut passwd = BASE_PASSWD.to_owned();
    let mut group = BASE_GROUP.to_owned();

    if username != "root" {
        passwd.push_str(&format!("{username}:x:1000:1000:{username}:/:/bin/ash\n"));
        group.push_str(&format!("{username}:x:1000:\n"));
    }

    let mut builder = Builder::new(Vec::new());
    for (name, body) in [("passwd", passwd.as_str()), ("group", group.as_str())] {
        let mut header = Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes())?;
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn entries(data: &[u8]) -> Vec<(String, String)> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                (name, body)
            })
            .collect()
    }

    #[test]
    fn contains_passwd_and_group() {
        let tar = profile_tar("tester").unwrap();
        let names: Vec<_> = entries(&tar).into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["passwd".to_owned(), "group".to_owned()]);
    }

    #[test]
    fn non_root_user_gets_account_line() {
        let tar = profile_tar("alice").unwrap();
        let all = entries(&tar);
        let passwd = &all.iter().find(|(name, _)| name == "passwd").unwrap().1;
        let group = &all.iter().find(|(name, _)| name == "group").unwrap().1;

        assert!(passwd
            .lines()
            .any(|line| line.starts_with("alice:x:1000:1000:")));
        assert!(group.lines().any(|line| line == "alice:x:1000:"));
    }

    #[test]
    fn root_profile_is_stock() {
        let tar = profile_tar("root").unwrap();
        let all = entries(&tar);
        let passwd = &all.iter().find(|(name, _)| name == "passwd").unwrap().1;
        assert_eq!(passwd, BASE_PASSWD);
    }
}
