//! Captured nmap XML output used by tests and benches.

/// `nmap -sT -sV -O --top-ports 100 -oX - scanme.nmap.org`, trimmed.
///
/// One host up with ports 22 and 80 open and 25 filtered, an `http-title`
/// port script, a `clock-skew` host script and one OS match.
pub const SCANME_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<?xml-stylesheet href="file:///usr/bin/../share/nmap/nmap.xsl" type="text/xsl"?>
<nmaprun scanner="nmap" args="nmap -sT -sV -O --top-ports 100 -oX - scanme.nmap.org" start="1718000000" startstr="Mon Jun 10 06:13:20 2024" version="7.94" xmloutputversion="1.05">
<scaninfo type="connect" protocol="tcp" numservices="100" services="7,9,13,21-23,25-26,37,53,79-81,88,106,110-111,113,119,135,139,143-144,179,199,389,427,443-445,465,513-515,543-544,548,554,587,631,646,873,990,993,995,1025-1029,1110,1433,1720,1723,1755,1900,2000-2001,2049,2121,2717,3000,3128,3306,3389,3986,4899,5000,5009,5051,5060,5101,5190,5357,5432,5631,5666,5800,5900,6000-6001,6646,7070,8000,8008-8009,8080-8081,8443,8888,9100,9999-10000,32768,49152-49157"/>
<verbose level="0"/>
<debugging level="0"/>
<hosthint><status state="up" reason="unknown-response" reason_ttl="0"/>
<address addr="45.33.32.156" addrtype="ipv4"/>
<hostnames>
<hostname name="scanme.nmap.org" type="user"/>
</hostnames>
</hosthint>
<host starttime="1718000001" endtime="1718000012"><status state="up" reason="syn-ack" reason_ttl="0"/>
<address addr="45.33.32.156" addrtype="ipv4"/>
<hostnames>
<hostname name="scanme.nmap.org" type="user"/>
<hostname name="scanme.nmap.org" type="PTR"/>
</hostnames>
<ports><extraports state="closed" count="97">
<extrareasons reason="conn-refused" count="97" proto="tcp" ports="7,9,13,21,23,26,37,53,79,81,88,106,110-111,113,119,135,139,143-144,179,199,389,427,443-445,465,513-515,543-544,548,554,587,631,646,873,990,993,995,1025-1029,1110,1433,1720,1723,1755,1900,2000-2001,2049,2121,2717,3000,3128,3306,3389,3986,4899,5000,5009,5051,5060,5101,5190,5357,5432,5631,5666,5800,5900,6000-6001,6646,7070,8000,8008-8009,8080-8081,8443,8888,9100,9999-10000,32768,49152-49157"/>
</extraports>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack" reason_ttl="0"/><service name="ssh" product="OpenSSH" version="6.6.1p1 Ubuntu 2ubuntu2.13" extrainfo="Ubuntu Linux; protocol 2.0" ostype="Linux" method="probed" conf="10"><cpe>cpe:/a:openbsd:openssh:6.6.1p1</cpe><cpe>cpe:/o:linux:linux_kernel</cpe></service></port>
<port protocol="tcp" portid="25"><state state="filtered" reason="no-response" reason_ttl="0"/><service name="smtp" method="table" conf="3"/></port>
<port protocol="tcp" portid="80"><state state="open" reason="syn-ack" reason_ttl="0"/><service name="http" product="Apache httpd" version="2.4.7" extrainfo="(Ubuntu)" method="probed" conf="10"><cpe>cpe:/a:apache:http_server:2.4.7</cpe></service><script id="http-title" output="Go ahead &amp; ScanMe!"/></port>
</ports>
<os><portused state="open" proto="tcp" portid="22"/>
<osmatch name="Linux 5.0 - 5.4" accuracy="95" line="67346">
<osclass type="general purpose" vendor="Linux" osfamily="Linux" osgen="5.X" accuracy="95"><cpe>cpe:/o:linux:linux_kernel:5</cpe></osclass>
</osmatch>
</os>
<hostscript><script id="clock-skew" output="-2s"><elem key="median">-2</elem></script></hostscript>
<times srtt="181234" rttvar="2341" to="200000"/>
</host>
<runstats><finished time="1718000012" timestr="Mon Jun 10 06:13:32 2024" summary="Nmap done at Mon Jun 10 06:13:32 2024; 1 IP address (1 host up) scanned in 12.34 seconds" elapsed="12.34" exit="success"/><hosts up="1" down="0" total="1"/>
</runstats>
</nmaprun>
"#;

/// A scan whose only target did not respond.
pub const EMPTY_SCAN_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -sT -oX - 10.255.255.1" start="1718000100" startstr="Mon Jun 10 06:15:00 2024" version="7.94" xmloutputversion="1.05">
<scaninfo type="connect" protocol="tcp" numservices="1000" services="1-1000"/>
<verbose level="0"/>
<debugging level="0"/>
<runstats><finished time="1718000103" timestr="Mon Jun 10 06:15:03 2024" summary="Nmap done at Mon Jun 10 06:15:03 2024; 1 IP address (0 hosts up) scanned in 3.05 seconds" elapsed="3.05" exit="success"/><hosts up="0" down="1" total="1"/>
</runstats>
</nmaprun>
"#;
