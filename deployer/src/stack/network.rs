//! Isolated network with a public tier and a NAT-egress private tier

use crate::stack::{
    config::Config,
    template::{get_att, name_tag, reference, select_az, Resource, Template},
    Error,
};
use serde_json::{json, Value};

pub const VPC_ID: &str = "Vpc";
const INTERNET_GATEWAY_ID: &str = "InternetGateway";
const GATEWAY_ATTACHMENT_ID: &str = "VpcGatewayAttachment";
const PUBLIC_ROUTE_TABLE_ID: &str = "PublicRouteTable";

/// Logical IDs of the declared network
pub struct Network {
    pub vpc: String,
    pub public_subnets: Vec<String>,
    pub private_subnets: Vec<String>,
}

fn availability_zone(config: &Config, index: usize) -> Value {
    match config.network.availability_zones.get(index) {
        Some(zone) => json!(zone),
        None => select_az(index),
    }
}

/// Declares the VPC, both subnet tiers, and their routing
pub fn build(template: &mut Template, config: &Config) -> Result<Network, Error> {
    let network = &config.network;
    let azs = network.max_azs;

    // Public subnets are carved first, then private (one of each per zone)
    let blocks = network.cidr.subnets(network.subnet_mask, azs * 2)?;
    let (public_blocks, private_blocks) = blocks.split_at(azs);

    template.add(
        VPC_ID,
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": network.cidr.to_string(),
                "EnableDnsSupport": true,
                "EnableDnsHostnames": true,
                "InstanceTenancy": "default",
                "Tags": name_tag(&config.physical_name("vpc")),
            }),
        ),
    )?;
    template.add(
        INTERNET_GATEWAY_ID,
        Resource::new(
            "AWS::EC2::InternetGateway",
            json!({ "Tags": name_tag(&config.physical_name("igw")) }),
        ),
    )?;
    template.add(
        GATEWAY_ATTACHMENT_ID,
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({
                "VpcId": reference(VPC_ID),
                "InternetGatewayId": reference(INTERNET_GATEWAY_ID),
            }),
        ),
    )?;

    // Public tier: shared route table with a default route to the internet gateway
    template.add(
        PUBLIC_ROUTE_TABLE_ID,
        Resource::new(
            "AWS::EC2::RouteTable",
            json!({
                "VpcId": reference(VPC_ID),
                "Tags": name_tag(&config.physical_name("public-rt")),
            }),
        ),
    )?;
    template.add(
        "PublicDefaultRoute",
        Resource::new(
            "AWS::EC2::Route",
            json!({
                "RouteTableId": reference(PUBLIC_ROUTE_TABLE_ID),
                "DestinationCidrBlock": "0.0.0.0/0",
                "GatewayId": reference(INTERNET_GATEWAY_ID),
            }),
        )
        .depends_on([GATEWAY_ATTACHMENT_ID]),
    )?;
    let mut public_subnets = Vec::with_capacity(azs);
    for (i, block) in public_blocks.iter().enumerate() {
        let id = format!("PublicSubnet{}", i + 1);
        template.add(
            &id,
            Resource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": reference(VPC_ID),
                    "CidrBlock": block.to_string(),
                    "AvailabilityZone": availability_zone(config, i),
                    "MapPublicIpOnLaunch": true,
                    "Tags": name_tag(&format!("{}-{}", config.physical_name("public-subnet"), i + 1)),
                }),
            ),
        )?;
        template.add(
            &format!("{id}RouteTableAssociation"),
            Resource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({
                    "RouteTableId": reference(PUBLIC_ROUTE_TABLE_ID),
                    "SubnetId": reference(&id),
                }),
            ),
        )?;
        public_subnets.push(id);
    }

    // NAT gateways live in the public tier
    let nat_gateways: Vec<String> = (0..network.nat_gateway_count())
        .map(|i| -> Result<String, Error> {
            let id = format!("NatGateway{}", i + 1);
            let eip = format!("{id}Eip");
            template.add(
                &eip,
                Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" }))
                    .depends_on([GATEWAY_ATTACHMENT_ID]),
            )?;
            template.add(
                &id,
                Resource::new(
                    "AWS::EC2::NatGateway",
                    json!({
                        "AllocationId": get_att(&eip, "AllocationId"),
                        "SubnetId": reference(&public_subnets[i]),
                        "Tags": name_tag(&format!("{}-{}", config.physical_name("nat"), i + 1)),
                    }),
                ),
            )?;
            Ok(id)
        })
        .collect::<Result<_, _>>()?;

    // Private tier: one route table per subnet, default route through a NAT gateway
    let mut private_subnets = Vec::with_capacity(azs);
    for (i, block) in private_blocks.iter().enumerate() {
        let id = format!("PrivateSubnet{}", i + 1);
        let route_table = format!("{id}RouteTable");
        template.add(
            &id,
            Resource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": reference(VPC_ID),
                    "CidrBlock": block.to_string(),
                    "AvailabilityZone": availability_zone(config, i),
                    "MapPublicIpOnLaunch": false,
                    "Tags": name_tag(&format!("{}-{}", config.physical_name("private-subnet"), i + 1)),
                }),
            ),
        )?;
        template.add(
            &route_table,
            Resource::new(
                "AWS::EC2::RouteTable",
                json!({
                    "VpcId": reference(VPC_ID),
                    "Tags": name_tag(&format!("{}-{}", config.physical_name("private-rt"), i + 1)),
                }),
            ),
        )?;
        template.add(
            &format!("{id}DefaultRoute"),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": reference(&route_table),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "NatGatewayId": reference(&nat_gateways[i % nat_gateways.len()]),
                }),
            ),
        )?;
        template.add(
            &format!("{id}RouteTableAssociation"),
            Resource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({
                    "RouteTableId": reference(&route_table),
                    "SubnetId": reference(&id),
                }),
            ),
        )?;
        private_subnets.push(id);
    }

    Ok(Network {
        vpc: VPC_ID.to_string(),
        public_subnets,
        private_subnets,
    })
}
